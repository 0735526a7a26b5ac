use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use modmeter_rs::config::{Parity, DEFAULT_TCP_PORT};
use modmeter_rs::{
    init_logger, log_info, DiagContext, LogPublisher, Meter, MeterService, ModbusTransport,
    ProbeRegistry, ServiceCommand, ServiceConfig, TransportSpec,
};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "modmeter")]
#[command(about = "Probe and poll Modbus energy meters")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Target {
    /// Modbus/TCP endpoint, host[:port]
    #[arg(long, conflicts_with = "rtu")]
    tcp: Option<String>,
    /// Serial port for Modbus RTU
    #[arg(long)]
    rtu: Option<String>,
    #[arg(short, long, default_value = "9600")]
    baudrate: u32,
    #[arg(short, long, default_value = "1")]
    unit: u8,
    #[arg(long, default_value = "1000")]
    timeout_ms: u64,
}

impl Target {
    fn spec(&self) -> Result<TransportSpec> {
        match (&self.tcp, &self.rtu) {
            (Some(endpoint), None) => {
                let (host, port) = match endpoint.rsplit_once(':') {
                    Some((host, port)) => (
                        host.to_string(),
                        port.parse().with_context(|| format!("bad port in {endpoint}"))?,
                    ),
                    None => (endpoint.clone(), DEFAULT_TCP_PORT),
                };
                Ok(TransportSpec::Tcp { host, port })
            }
            (None, Some(port)) => Ok(TransportSpec::Rtu {
                port: port.clone(),
                baudrate: self.baudrate,
                parity: Parity::None,
            }),
            _ => bail!("exactly one of --tcp or --rtu is required"),
        }
    }

    async fn open(&self) -> Result<(TransportSpec, Box<dyn ModbusTransport>)> {
        let spec = self.spec()?;
        let transport = spec
            .open(Duration::from_millis(self.timeout_ms))
            .await
            .with_context(|| format!("cannot open {}", spec.describe()))?;
        Ok((spec, transport))
    }

    /// Probe and initialise the meter at `unit`.
    async fn meter(&self) -> Result<(Box<dyn ModbusTransport>, Meter)> {
        let (spec, mut transport) = self.open().await?;
        let found = ProbeRegistry::global()
            .probe(transport.as_mut(), self.unit)
            .await
            .with_context(|| format!("probing {}:{}", spec.describe(), self.unit))?;
        let ctx = DiagContext::new(format!("{}:{}", spec.describe(), self.unit));
        let mut meter = Meter::new(found, ctx);
        meter
            .init(transport.as_mut())
            .await
            .context("meter initialisation failed")?;
        Ok((transport, meter))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Identify the meter model
    Probe {
        #[command(flatten)]
        target: Target,
    },
    /// Poll the meter and print every value
    Poll {
        #[command(flatten)]
        target: Target,
        #[arg(short = 'n', long, default_value = "1")]
        cycles: u32,
        #[arg(long, default_value = "1000")]
        interval_ms: u64,
    },
    /// Write a logical value, e.g. `/PhaseConfig 3`
    Write {
        #[command(flatten)]
        target: Target,
        path: String,
        value: f64,
    },
    /// Run the service from a configuration file
    Run {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logger();

    let cli = Cli::parse();

    match cli.command {
        Commands::Probe { target } => {
            let (_, mut transport) = target.open().await?;
            let found = ProbeRegistry::global()
                .probe(transport.as_mut(), target.unit)
                .await?;
            log_info(&format!(
                "{} {} (code {}) at unit {}",
                found.info.family, found.info.model, found.info.code, found.info.unit
            ));
        }
        Commands::Poll {
            target,
            cycles,
            interval_ms,
        } => {
            let (mut transport, mut meter) = target.meter().await?;
            if let Some(info) = meter.device_info() {
                println!("{}", serde_json::to_string_pretty(&info)?);
            }
            for cycle in 0..cycles {
                if cycle > 0 {
                    tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                }
                let outcome = meter.update(transport.as_mut()).await?;
                for update in outcome.updates {
                    match update.value {
                        Some(value) => println!("{} = {value}", update.path),
                        None => println!("{} invalid", update.path),
                    }
                }
            }
        }
        Commands::Write {
            target,
            path,
            value,
        } => {
            let (mut transport, mut meter) = target.meter().await?;
            let outcome = meter
                .write(transport.as_mut(), &path, value)
                .await
                .with_context(|| format!("writing {value} to {path}"))?;
            log_info(&format!(
                "{path} = {}{}",
                outcome.readback,
                if outcome.reinitialized { " (re-initialised)" } else { "" }
            ));
        }
        Commands::Run { config } => {
            let config = ServiceConfig::load(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            let service = MeterService::new(config, Arc::new(LogPublisher))?;
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let _ = tx.send(ServiceCommand::Shutdown).await;
                }
            });
            service.run(rx).await;
        }
    }

    Ok(())
}
