use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Stdin, Stdout};

use crate::error_handling::types::LabError;
use crate::network_engine::NetworkEngine;

const PROMPT: &str = "minilab> ";

/// Whatever holds control while the lab is running.
///
/// The lab is torn down as soon as `run` returns, successful or not.
#[async_trait]
pub trait InteractiveSession: Send {
    async fn run(&mut self, engine: &dyn NetworkEngine) -> Result<(), LabError>;
}

/// Line-oriented console on top of the network engine.
///
/// Commands:
/// - `nodes`: list nodes and their interfaces
/// - `<node> <command...>`: run a command inside the node's namespace
/// - `help`
/// - `exit`, `quit` or end of input: end the session
pub struct ConsoleSession<R, W> {
    input: R,
    output: W,
}

impl ConsoleSession<BufReader<Stdin>, Stdout> {
    pub fn stdio() -> Self {
        ConsoleSession::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

impl<R, W> ConsoleSession<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(input: R, output: W) -> Self {
        ConsoleSession { input, output }
    }

    pub fn into_output(self) -> W {
        self.output
    }

    async fn write(&mut self, text: &str) -> Result<(), LabError> {
        self.output
            .write_all(text.as_bytes())
            .await
            .map_err(|e| LabError::SessionFailed(e.to_string()))?;
        self.output
            .flush()
            .await
            .map_err(|e| LabError::SessionFailed(e.to_string()))
    }

    async fn handle_line(
        &mut self,
        engine: &dyn NetworkEngine,
        line: &str,
    ) -> Result<bool, LabError> {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            [] => {}
            ["exit"] | ["quit"] => return Ok(false),
            ["help"] => {
                self.write("nodes                 list nodes\n<node> <command...>   run a command on a node\nexit                  stop the lab\n")
                    .await?
            }
            ["nodes"] => {
                let mut listing = String::new();
                for node in engine.nodes() {
                    listing.push_str(&format!("{} {}\n", node.name, node.interfaces.join(",")));
                }
                self.write(&listing).await?;
            }
            [name, command @ ..] => match engine.node(name).cloned() {
                None => self.write(&format!("*** Unknown command: {}\n", line.trim())).await?,
                Some(_) if command.is_empty() => {
                    self.write(&format!("*** No command given for {}\n", name)).await?
                }
                Some(node) => {
                    debug!("[{}] {}", node.name, command.join(" "));
                    match engine.exec(&node, command).await {
                        Ok(output) => {
                            let text = format!("{}{}", output.stdout, output.stderr);
                            self.write(&text).await?;
                        }
                        Err(e) => {
                            warn!("Command on {} failed: {}", node.name, e);
                            self.write(&format!("*** {}\n", e)).await?;
                        }
                    }
                }
            },
        }
        Ok(true)
    }
}

#[async_trait]
impl<R, W> InteractiveSession for ConsoleSession<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn run(&mut self, engine: &dyn NetworkEngine) -> Result<(), LabError> {
        info!("Starting CLI, type 'help' for commands and 'exit' to stop the lab");
        loop {
            self.write(PROMPT).await?;
            let mut line = String::new();
            let read = self
                .input
                .read_line(&mut line)
                .await
                .map_err(|e| LabError::SessionFailed(e.to_string()))?;
            if read == 0 {
                self.write("\n").await?;
                break;
            }
            if !self.handle_line(engine, &line).await? {
                break;
            }
        }
        info!("CLI session ended");
        Ok(())
    }
}
