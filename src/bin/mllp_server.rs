use std::{error::Error, sync::Arc};

use clap::Parser;
use log::info;
use mllp::{
    HandlerRegistry, MllpConfig, MllpServer,
    protocol::{AckCode, DEFAULT_ROUTE, Exchange, header, hl7},
};

/// Listens for MLLP connections and acknowledges every message received.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Acknowledgement code to answer with (AA, AE or AR)
    #[arg(long, default_value = "AA")]
    reply: AckCode,

    #[command(flatten)]
    config: MllpConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let reply = cli.reply;
    let log_phi = cli.config.log_phi;

    let handlers = HandlerRegistry::new();
    handlers.register_fn(DEFAULT_ROUTE, move |exchange: &mut Exchange| {
        info!(
            "{} from {}: {}",
            exchange.header(header::MLLP_MESSAGE_TYPE).unwrap_or("message"),
            exchange.header(header::MLLP_REMOTE_ADDRESS).unwrap_or("unknown"),
            hl7::loggable(exchange.payload(), log_phi)
        );
        exchange.acknowledge(reply, None);
        Ok(())
    });

    let server = MllpServer::new(cli.config, Arc::new(handlers)).bind()?;
    let signal = server.shutdown_signal();
    ctrlc::set_handler(move || signal.trigger())?;

    server.wait();
    Ok(())
}
