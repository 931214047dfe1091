/// Communication layer for GDB/MI protocol
///
/// This module handles the low-level communication with GDB: numbering and
/// writing commands, and collecting output lines into prompt-terminated
/// batches. It owns the debugger's streams and performs a single read at a
/// time, so batches always come out in the order GDB wrote them.
/// Partial lines and batches live in the struct, which makes `read_batch`
/// safe to use as a `tokio::select!` branch.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use thiserror::Error;

use crate::parser::PROMPT;

#[derive(Error, Debug)]
pub enum CommunicationError {
    #[error("I/O error on debugger channel: {0}")]
    Io(#[from] std::io::Error),
    #[error("Debugger channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, CommunicationError>;

/// Manages communication with GDB process
pub struct GdbCommunication<R, W> {
    reader: BufReader<R>,
    writer: W,
    token_counter: u32,
    prompt: String,
    line: Vec<u8>,
    batch: String,
}

impl<R, W> GdbCommunication<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Create a new communication manager; the first command gets `initial_token`
    pub fn new(reader: R, writer: W, initial_token: u32) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
            token_counter: initial_token,
            prompt: PROMPT.to_string(),
            line: Vec::new(),
            batch: String::new(),
        }
    }

    /// Use a different batch terminator
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// Token the next MI command will carry
    pub fn next_token(&self) -> u32 {
        self.token_counter
    }

    /// Send an MI command (without its leading dash) and return its token
    pub async fn send_command(&mut self, command: &str) -> Result<u32> {
        let token = self.token_counter;
        self.token_counter += 1;

        let command_line = format!("{}-{}\n", token, command);
        log::debug!("SEND[{}]: {}", token, command_line.trim_end());

        self.write_line(&command_line).await?;
        Ok(token)
    }

    /// Send a CLI command verbatim, without a token
    pub async fn send_cli(&mut self, command: &str) -> Result<()> {
        log::debug!("SEND[CLI]: {}", command);
        self.write_line(&format!("{}\n", command)).await
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Read lines until the prompt and return them, prompt included
    ///
    /// Returns `ChannelClosed` when GDB closes its output; any partial batch
    /// read before that is discarded with a warning.
    pub async fn read_batch(&mut self) -> Result<String> {
        loop {
            if self.reader.read_until(b'\n', &mut self.line).await? == 0 {
                if !self.batch.is_empty() {
                    log::warn!("GDB output ended mid-batch: {:?}", self.batch);
                    self.batch.clear();
                }
                return Err(CommunicationError::ChannelClosed);
            }
            // A final line without newline is still a line; the next read
            // reports the close
            let line = String::from_utf8_lossy(&self.line).trim_end().to_string();
            self.line.clear();
            log::trace!("GDB_OUT: {}", line);

            if line == self.prompt {
                let mut batch = std::mem::take(&mut self.batch);
                batch.push_str(PROMPT);
                batch.push('\n');
                return Ok(batch);
            }
            if !line.is_empty() {
                self.batch.push_str(&line);
                self.batch.push('\n');
            }
        }
    }
}
