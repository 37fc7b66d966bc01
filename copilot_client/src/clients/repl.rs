//! Interactive REPL-style command-line interface client.

use std::io::{self, Write};
use std::str::SplitWhitespace;

use tokio::sync::watch;
use tokio::time::Instant;

use copilot::{CopilotClient, CopilotError, StaticDirectory, Value};

/// Prompt string at the start of line.
const PROMPT: &str = ">>>>> ";

/// Recognizable command types.
#[derive(Debug, PartialEq, Eq)]
enum ReplCommand {
    /// Read a key's value.
    Get { key: String },

    /// Write a key's value.
    Put { key: String, value: String },

    /// Print help message.
    PrintHelp,

    /// Client exit.
    Exit,

    /// Nothing read.
    Nothing,
}

/// Interactive REPL-style client struct.
pub struct ClientRepl {
    /// CoPilot client session.
    client: CopilotClient,

    /// User input buffer.
    input_buf: String,
}

impl ClientRepl {
    /// Creates a new REPL-style client, setting up its session.
    pub async fn new_and_setup(
        mut directory: StaticDirectory,
        config_str: Option<String>,
        rx_term: watch::Receiver<bool>,
    ) -> Result<Self, CopilotError> {
        let client = CopilotClient::new_and_setup(
            &mut directory,
            config_str.as_deref(),
            rx_term,
        )
        .await?;
        Ok(ClientRepl {
            client,
            input_buf: String::new(),
        })
    }

    /// Prints the prompt string.
    #[inline]
    fn print_prompt() -> Result<(), CopilotError> {
        print!("{}", PROMPT);
        io::stdout().flush()?;
        Ok(())
    }

    /// Prints (optionally) an error message and the help message.
    fn print_help(err: Option<&CopilotError>) {
        if let Some(e) = err {
            println!("✗ {}", e);
        }
        println!("HELP: Supported commands are:");
        println!("          get <key>");
        println!("          put <key> <value>");
        println!("          help");
        println!("          exit");
        println!(
            "      Keys and values currently cannot contain any whitespaces"
        );
    }

    /// Expect to get the next segment string from parsed segs.
    #[inline]
    fn expect_next_seg<'s>(
        segs: &mut SplitWhitespace<'s>,
    ) -> Result<&'s str, CopilotError> {
        segs.next().ok_or(CopilotError::msg("not enough args"))
    }

    /// Parses one input line into a command.
    fn parse_command(line: &str) -> Result<ReplCommand, CopilotError> {
        // split input line by whitespaces, getting an iterator of segments
        let mut segs = line.split_whitespace();

        // get command type, match case-insensitively
        let cmd_type = match segs.next() {
            Some(seg) => seg,
            None => return Ok(ReplCommand::Nothing),
        };

        match &cmd_type.to_lowercase()[..] {
            "get" => {
                // keys are kept as-is, no case conversions
                let key = Self::expect_next_seg(&mut segs)?;
                Ok(ReplCommand::Get { key: key.into() })
            }

            "put" => {
                // keys and values are kept as-is, no case conversions
                let key = Self::expect_next_seg(&mut segs)?;
                let value = Self::expect_next_seg(&mut segs)?;
                Ok(ReplCommand::Put {
                    key: key.into(),
                    value: value.into(),
                })
            }

            "help" => Ok(ReplCommand::PrintHelp),

            "exit" => Ok(ReplCommand::Exit),

            _ => Err(CopilotError::msg(format!(
                "unrecognized command: {}",
                cmd_type
            ))),
        }
    }

    /// Reads in user input and parses into a command.
    fn read_command(&mut self) -> Result<ReplCommand, CopilotError> {
        self.input_buf.clear();
        let nread = io::stdin().read_line(&mut self.input_buf)?;
        if nread == 0 {
            return Ok(ReplCommand::Exit);
        }
        Self::parse_command(self.input_buf.trim())
    }

    /// Renders a fixed-width value for printing, dropping zero padding.
    fn display_value(value: &Value) -> String {
        let bytes = value.as_bytes();
        let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
        String::from_utf8_lossy(&bytes[..end]).into_owned()
    }

    /// One iteration of the REPL loop.
    async fn iter(&mut self) -> Result<bool, CopilotError> {
        Self::print_prompt()?;

        let cmd = match self.read_command() {
            Ok(cmd) => cmd,
            Err(e) => {
                Self::print_help(Some(&e));
                return Ok(true);
            }
        };

        let start = Instant::now();
        match cmd {
            ReplCommand::Exit => {
                println!("Exitting...");
                Ok(false)
            }

            ReplCommand::Nothing => Ok(true),

            ReplCommand::PrintHelp => {
                Self::print_help(None);
                Ok(true)
            }

            ReplCommand::Get { key } => {
                let value = self.client.get(key.as_bytes()).await?;
                println!(
                    "✓ {:?} <<took {:.2} ms>>",
                    Self::display_value(&value),
                    start.elapsed().as_secs_f64() * 1000.0
                );
                Ok(true)
            }

            ReplCommand::Put { key, value } => {
                self.client.put(key.as_bytes(), value.as_bytes()).await?;
                println!(
                    "✓ ok <<took {:.2} ms>>",
                    start.elapsed().as_secs_f64() * 1000.0
                );
                Ok(true)
            }
        }
    }

    /// Runs the infinite REPL loop.
    pub async fn run(&mut self) -> Result<(), CopilotError> {
        while self.iter().await? {}
        Ok(())
    }
}

#[cfg(test)]
mod repl_tests {
    use super::*;

    #[test]
    fn parse_commands() -> Result<(), CopilotError> {
        assert_eq!(
            ClientRepl::parse_command("GET key1")?,
            ReplCommand::Get { key: "key1".into() }
        );
        assert_eq!(
            ClientRepl::parse_command("put Key1 Value1")?,
            ReplCommand::Put {
                key: "Key1".into(),
                value: "Value1".into()
            }
        );
        assert_eq!(ClientRepl::parse_command("")?, ReplCommand::Nothing);
        assert_eq!(ClientRepl::parse_command("help")?, ReplCommand::PrintHelp);
        assert_eq!(ClientRepl::parse_command("exit")?, ReplCommand::Exit);
        Ok(())
    }

    #[test]
    fn parse_bad_commands() {
        assert!(ClientRepl::parse_command("put key1").is_err());
        assert!(ClientRepl::parse_command("delete key1").is_err());
    }

    #[test]
    fn value_display_trims_padding() {
        assert_eq!(
            ClientRepl::display_value(&Value::from_slice(b"hello")),
            "hello"
        );
        assert_eq!(ClientRepl::display_value(&Value::default()), "");
    }
}
