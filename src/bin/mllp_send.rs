use std::{
    error::Error,
    io::{self, Write},
};

use clap::Parser;
use mllp::{
    Command, MllpClient, MllpConfig,
    cli::{CliError, load_message},
    prompt,
    protocol::{Headers, hl7},
};

/// Sends HL7 messages typed at the prompt to an MLLP listener.
///
/// Type one segment per line and finish the message with a blank line. `.file <path>`
/// sends a message from a file, `.close` drops the connection and `.exit` quits.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    config: MllpConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let mut client = MllpClient::new(cli.config);
    let stdio = io::stdin();
    let stdout = io::stdout();

    loop {
        let reader = stdio.lock();
        let writer = StdOut {
            inner: stdout.lock(),
        };

        let message = match prompt(reader, writer) {
            Ok(Command::Exit) => break,
            Ok(Command::Close) => {
                client.close();
                continue;
            }
            Ok(Command::Send(message)) => message,
            Ok(Command::File(path)) => match load_message(&path) {
                Ok(message) => message,
                Err(e) => {
                    eprintln!("{}: {e}", path.display());
                    continue;
                }
            },
            Err(CliError::Empty) => continue,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };

        match client.send(&message, &Headers::new()) {
            Ok(ack) => println!("{:?}\n{}", ack.outcome, hl7::print_friendly(&ack.payload)),
            Err(e) => {
                eprintln!("send failed: {e}");
                if let Some(ack) = e.acknowledgement() {
                    eprintln!("{}", hl7::print_friendly(&ack.payload));
                }
                eprintln!(
                    "outcome: {:?}, redelivery: {:?}",
                    e.outcome(),
                    e.redelivery()
                );
            }
        }
    }

    client.close();
    Ok(())
}

/// Flushes after every write so prompts show up before input is read.
struct StdOut<W: Write> {
    inner: W,
}

impl<W: Write> Write for StdOut<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.inner.flush()?;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
