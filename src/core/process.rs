use crate::error::{Result, ToolbeltError};
use crate::utils::runtime::outside_runtime;
use log::debug;
use std::ffi::OsStr;
use std::io::{self, ErrorKind, PipeReader, PipeWriter, Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

/// How a timed run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The process exited successfully before the deadline.
    Finished,
    /// The deadline passed first and the process was killed.
    TimedOut,
}

/// Where one of the child's output streams goes.
enum Output<'a> {
    Stdio(Stdio),
    Writer(Box<dyn Write + Send + 'a>),
}

enum Input<'a> {
    Stdio(Stdio),
    Reader(Box<dyn Read + Send + 'a>),
}

/// The standard streams handed to a child process.
///
/// Anything convertible into [`Stdio`] is attached to the child directly:
/// files, pipe ends, `Stdio::inherit()`, `Stdio::null()`. In-memory sinks and
/// sources (`Vec<u8>`, `&[u8]`, sockets, ...) go through [`Streams::writers`]
/// and [`Streams::with_stdin_reader`]; the runner copies them over pipes on
/// helper threads while the child runs.
///
/// `Stdio::piped()` is not read by anybody here, so a chatty child fills
/// the pipe and stalls. Use a writer instead.
///
/// Without an explicit stdin the child reads from the null device.
pub struct Streams<'a> {
    stdin: Option<Input<'a>>,
    stdout: Output<'a>,
    stderr: Output<'a>,
}

impl Default for Streams<'_> {
    fn default() -> Self {
        Self::new(Stdio::inherit(), Stdio::inherit())
    }
}

impl<'a> Streams<'a> {
    pub fn new(stdout: impl Into<Stdio>, stderr: impl Into<Stdio>) -> Self {
        Self {
            stdin: None,
            stdout: Output::Stdio(stdout.into()),
            stderr: Output::Stdio(stderr.into()),
        }
    }

    /// Copies the child's stdout and stderr into the given writers.
    pub fn writers(stdout: impl Write + Send + 'a, stderr: impl Write + Send + 'a) -> Self {
        Self {
            stdin: None,
            stdout: Output::Writer(Box::new(stdout)),
            stderr: Output::Writer(Box::new(stderr)),
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<Stdio>) -> Self {
        self.stdin = Some(Input::Stdio(stdin.into()));
        self
    }

    /// Feeds the child's stdin from `stdin`, closing it at end of input.
    pub fn with_stdin_reader(mut self, stdin: impl Read + Send + 'a) -> Self {
        self.stdin = Some(Input::Reader(Box::new(stdin)));
        self
    }

    /// Wires the streams into `cmd`. Readers and writers are swapped for
    /// pipe ends here; the returned [`Pumps`] own the other ends.
    fn attach(self, cmd: &mut Command) -> io::Result<Pumps<'a>> {
        let mut pumps = Pumps::default();

        match self.stdin {
            None => {
                cmd.stdin(Stdio::null());
            }
            Some(Input::Stdio(stdio)) => {
                cmd.stdin(stdio);
            }
            Some(Input::Reader(source)) => {
                let (reader, writer) = io::pipe()?;
                cmd.stdin(reader);
                pumps.stdin = Some((source, writer));
            }
        }

        match self.stdout {
            Output::Stdio(stdio) => {
                cmd.stdout(stdio);
            }
            Output::Writer(sink) => {
                let (reader, writer) = io::pipe()?;
                cmd.stdout(writer);
                pumps.outputs.push((reader, sink));
            }
        }

        match self.stderr {
            Output::Stdio(stdio) => {
                cmd.stderr(stdio);
            }
            Output::Writer(sink) => {
                let (reader, writer) = io::pipe()?;
                cmd.stderr(writer);
                pumps.outputs.push((reader, sink));
            }
        }

        Ok(pumps)
    }
}

/// Copy jobs between caller-side readers/writers and the child's pipes.
#[derive(Default)]
struct Pumps<'a> {
    stdin: Option<(Box<dyn Read + Send + 'a>, PipeWriter)>,
    outputs: Vec<(PipeReader, Box<dyn Write + Send + 'a>)>,
}

impl Pumps<'_> {
    /// Runs `wait` on the calling thread while the copies run on scoped
    /// threads, then joins them.
    ///
    /// The output copies end once every holder of the pipe's write end is
    /// gone, so the `Command` that spawned the child must be dropped before
    /// `wait` returns.
    fn run<T>(self, wait: impl FnOnce() -> T) -> (T, io::Result<()>) {
        let Pumps { stdin, outputs } = self;

        thread::scope(|scope| {
            let feeder = stdin.map(|(mut source, mut sink)| {
                scope.spawn(move || match io::copy(&mut source, &mut sink) {
                    // The child may exit without reading all of its input
                    Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
                    copied => copied.map(drop),
                })
            });
            let drains: Vec<_> = outputs
                .into_iter()
                .map(|(mut source, mut sink)| {
                    scope.spawn(move || {
                        io::copy(&mut source, &mut sink)?;
                        sink.flush()
                    })
                })
                .collect();

            let waited = wait();

            let mut pumped = Ok(());
            for handle in feeder.into_iter().chain(drains) {
                let result = handle
                    .join()
                    .unwrap_or_else(|payload| std::panic::resume_unwind(payload));
                if pumped.is_ok() {
                    pumped = result;
                }
            }
            (waited, pumped)
        })
    }
}

/// Runs `command` and returns its stdout and stderr as one text, in the
/// order the child wrote them.
///
/// On a non-zero exit the text is still available through
/// [`ToolbeltError::output`].
pub fn run_captured<I, S>(command: &str, args: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = build(command, args);
    let line = command_line(&cmd);
    debug!("Running {line}");

    let (mut reader, writer) = io::pipe()?;
    cmd.stdin(Stdio::null())
        .stdout(writer.try_clone()?)
        .stderr(writer);

    let mut child = cmd.spawn().map_err(ToolbeltError::spawn(command))?;
    // The command holds the write ends; they must close for EOF to arrive
    drop(cmd);

    let mut raw = Vec::new();
    let read = reader.read_to_end(&mut raw);
    let status = child.wait()?;
    read?;

    let output = String::from_utf8_lossy(&raw).into_owned();
    if status.success() {
        Ok(output)
    } else {
        Err(ToolbeltError::Exit {
            command: command.to_string(),
            status,
            output: Some(output),
        })
    }
}

/// Runs `command` with the given streams attached and waits for it to exit.
///
/// An exit failure takes precedence over a failure to copy a stream.
pub fn run_wired<I, S>(command: &str, streams: Streams<'_>, args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = build(command, args);
    let pumps = streams.attach(&mut cmd)?;
    debug!("Running {}", command_line(&cmd));

    let mut child = cmd.spawn().map_err(ToolbeltError::spawn(command))?;
    drop(cmd);

    let (status, pumped) = pumps.run(|| child.wait());
    check_status(command, status?, None)?;
    pumped?;
    Ok(())
}

/// Like [`run_wired`], but kills the process once `timeout` has elapsed.
///
/// Running out of time is not an error: the process is killed and reaped and
/// `Completion::TimedOut` is returned. Only a failing kill is reported as one.
///
/// The timer runs on a runtime of its own. Called from async code, the whole
/// run moves to a separate thread and the calling thread blocks until it is
/// done.
///
/// With writer streams the call also waits for the pipes to close, which a
/// grandchild that inherited them can delay past the kill.
pub fn run_with_timeout<I, S>(
    command: &str,
    timeout: Duration,
    streams: Streams<'_>,
    args: I,
) -> Result<Completion>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = build(command, args);
    let pumps = streams.attach(&mut cmd)?;
    debug!("Running {} with a {timeout:?} timeout", command_line(&cmd));

    outside_runtime(move || -> Result<Completion> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (completion, pumped) =
            pumps.run(|| runtime.block_on(wait_or_kill(command, cmd, timeout)));
        let completion = completion?;
        pumped?;
        Ok(completion)
    })
}

async fn wait_or_kill(command: &str, cmd: Command, timeout: Duration) -> Result<Completion> {
    // The command is dropped right after spawning, closing the parent's pipe ends
    let mut child = tokio::process::Command::from(cmd)
        .spawn()
        .map_err(ToolbeltError::spawn(command))?;

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => {
            check_status(command, status?, None)?;
            Ok(Completion::Finished)
        }
        Err(_) => {
            debug!("'{command}' timed out after {timeout:?}, killing it");
            child.kill().await.map_err(|source| ToolbeltError::Kill {
                command: command.to_string(),
                source,
            })?;
            Ok(Completion::TimedOut)
        }
    }
}

fn build<I, S>(command: &str, args: I) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(command);
    cmd.args(args);
    cmd
}

fn command_line(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|part| part.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

fn check_status(command: &str, status: ExitStatus, output: Option<String>) -> Result<()> {
    if status.success() {
        Ok(())
    } else {
        Err(ToolbeltError::Exit {
            command: command.to_string(),
            status,
            output,
        })
    }
}
