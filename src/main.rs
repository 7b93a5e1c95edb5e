//! CLI entry point. Positional serial port arguments override
//! `background.json`'s configured ports when given; everything else (baud
//! rate, clear interval) comes from config. See SPEC_FULL.md §5/§6.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use wiretap_lib::controller::{self, ControllerConfig};
use wiretap_lib::logging::{init_file_logging, tlog};
use wiretap_lib::modbus_tcp::{self, PollGroup, RegisterType, TcpReaderConfig};
use wiretap_lib::{config, error::Result};

#[derive(Debug, Parser)]
#[command(author, version, about = "Passive Modbus RTU bus tap")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Serial port paths to tap. Overrides background.json's configured
    /// ports when given; leave empty to use the configured list as-is.
    /// Ignored when a subcommand is given.
    ports: Vec<String>,

    /// Directory holding background.json, site_devices.json, and
    /// sos_templates_modbus.json.
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,

    /// Directory for the raw/measure SQLite stores and live-status JSON.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Directory for rotated log files.
    #[arg(long, default_value = "logs")]
    logs_dir: PathBuf,

    /// Serial baud rate.
    #[arg(long, default_value_t = 9600)]
    baud_rate: u32,
}

/// The sibling probe/scanner surface (SPEC_FULL.md §6.1/§6.2), reachable
/// alongside the default passive-tap behavior rather than as a second binary.
#[derive(Debug, Subcommand)]
enum Command {
    /// One-shot active Modbus-TCP diagnostics: register reads and device
    /// discovery scans, distinct from the passive serial wiretap above.
    ModbusTcp {
        #[command(subcommand)]
        action: ModbusTcpCommand,
    },
}

#[derive(Debug, Subcommand)]
enum ModbusTcpCommand {
    /// Connect once and read one register range.
    Read {
        host: String,
        #[arg(long, default_value_t = 502)]
        port: u16,
        #[arg(long)]
        unit_id: u8,
        #[arg(long, value_enum)]
        register_type: RegisterTypeArg,
        #[arg(long)]
        start_address: u16,
        #[arg(long)]
        quantity: u16,
    },
    /// Scan an address range, binary-subdividing on exception.
    ScanRegisters {
        host: String,
        #[arg(long, default_value_t = 502)]
        port: u16,
        #[arg(long)]
        unit_id: u8,
        #[arg(long, value_enum)]
        register_type: RegisterTypeArg,
        #[arg(long)]
        start_address: u16,
        #[arg(long)]
        end_address: u16,
        #[arg(long, default_value_t = 16)]
        max_chunk_size: u16,
    },
    /// Probe a unit-id range via FC43 with a register-probe fallback.
    ScanUnitIds {
        host: String,
        #[arg(long, default_value_t = 502)]
        port: u16,
        #[arg(long)]
        start_unit_id: u8,
        #[arg(long)]
        end_unit_id: u8,
        #[arg(long, default_value_t = 0)]
        probe_register: u16,
        #[arg(long, value_enum, default_value = "holding")]
        probe_register_type: RegisterTypeArg,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RegisterTypeArg {
    Holding,
    Input,
    Coil,
    Discrete,
}

impl From<RegisterTypeArg> for RegisterType {
    fn from(v: RegisterTypeArg) -> Self {
        match v {
            RegisterTypeArg::Holding => RegisterType::Holding,
            RegisterTypeArg::Input => RegisterType::Input,
            RegisterTypeArg::Coil => RegisterType::Coil,
            RegisterTypeArg::Discrete => RegisterType::Discrete,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::ModbusTcp { action }) = cli.command {
        return run_modbus_tcp_command(action);
    }

    if let Err(e) = init_file_logging(&cli.logs_dir) {
        eprintln!("warning: file logging disabled: {e}");
    }

    let background = config::load_background(&cli.config_dir.join("background.json"))?;
    let ports = if cli.ports.is_empty() {
        background.ports
    } else {
        cli.ports
    };

    tlog!("[main] starting wiretap on {} port(s): {:?}", ports.len(), ports);

    let stop = Arc::new(AtomicBool::new(false));
    spawn_signal_watcher(stop.clone());

    let config = ControllerConfig {
        ports,
        baud_rate: cli.baud_rate,
        clear_interval: background.clear_interval,
        site_devices_path: cli.config_dir.join("site_devices.json"),
        templates_path: cli.config_dir.join("sos_templates_modbus.json"),
        raw_db_path: cli.data_dir.join("raw.db"),
        measure_db_path: cli.data_dir.join("measures.db"),
        live_status_dir: cli.data_dir.join("live_status"),
    };

    let result = controller::run(config, stop);

    wiretap_lib::logging::stop_file_logging();
    result
}

/// Runs one active-diagnostic command to completion on a dedicated
/// current-thread runtime and prints its result. Synchronous, caller-driven:
/// no Controller, no stores, no live-status files, per
/// `modbus_tcp`'s own module doc.
fn run_modbus_tcp_command(action: ModbusTcpCommand) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to start modbus-tcp runtime");

    runtime.block_on(async move {
        match action {
            ModbusTcpCommand::Read {
                host,
                port,
                unit_id,
                register_type,
                start_address,
                quantity,
            } => {
                let mut reader_config = TcpReaderConfig::new(host, unit_id);
                reader_config.port = port;
                let polls = vec![PollGroup {
                    register_type: register_type.into(),
                    start_address,
                    quantity,
                }];
                let results = modbus_tcp::reader::read_all(&reader_config, &polls).await?;
                for result in results {
                    match result.outcome {
                        Ok(bytes) => println!("{:02X?}", bytes),
                        Err(e) => println!("error: {e}"),
                    }
                }
            }
            ModbusTcpCommand::ScanRegisters {
                host,
                port,
                unit_id,
                register_type,
                start_address,
                end_address,
                max_chunk_size,
            } => {
                let scan_config = modbus_tcp::scanner::RegisterScanConfig {
                    host,
                    port,
                    unit_id,
                    register_type: register_type.into(),
                    start_address,
                    end_address,
                    max_chunk_size,
                    request_timeout: Duration::from_secs(3),
                };
                let found = modbus_tcp::scan_registers(&scan_config).await?;
                for (address, value) in found {
                    println!("{address}\t{value:#04X}");
                }
            }
            ModbusTcpCommand::ScanUnitIds {
                host,
                port,
                start_unit_id,
                end_unit_id,
                probe_register,
                probe_register_type,
            } => {
                let scan_config = modbus_tcp::scanner::UnitIdScanConfig {
                    host,
                    port,
                    start_unit_id,
                    end_unit_id,
                    probe_register,
                    probe_register_type: probe_register_type.into(),
                    request_timeout: Duration::from_secs(3),
                };
                let found = modbus_tcp::scan_unit_ids(&scan_config).await?;
                for device in found {
                    println!(
                        "unit {}: vendor={:?} product={:?} revision={:?}",
                        device.unit_id, device.vendor, device.product_code, device.revision
                    );
                }
            }
        }
        Ok(())
    })
}

/// Watches SIGTERM/SIGINT/SIGHUP/SIGQUIT (Ctrl+C covers INT on platforms
/// without `tokio::signal::unix`) and flips the shared stop flag on the
/// first one received, so the Controller's sync loop notices it on its
/// next poll. Grounded in the teacher's sibling services' shutdown
/// handling, generalized from a single terminate+ctrl_c select to all four
/// signals §6 names.
fn spawn_signal_watcher(stop: Arc<AtomicBool>) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                tlog!("[main] failed to start signal-handling runtime: {}", e);
                return;
            }
        };

        runtime.block_on(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};

                let mut term = signal(SignalKind::terminate()).ok();
                let mut hup = signal(SignalKind::hangup()).ok();
                let mut quit = signal(SignalKind::quit()).ok();

                let term_recv = async {
                    match term.as_mut() {
                        Some(s) => s.recv().await,
                        None => std::future::pending().await,
                    }
                };
                let hup_recv = async {
                    match hup.as_mut() {
                        Some(s) => s.recv().await,
                        None => std::future::pending().await,
                    }
                };
                let quit_recv = async {
                    match quit.as_mut() {
                        Some(s) => s.recv().await,
                        None => std::future::pending().await,
                    }
                };

                tokio::select! {
                    _ = term_recv => tlog!("[main] SIGTERM received, shutting down"),
                    _ = hup_recv => tlog!("[main] SIGHUP received, shutting down"),
                    _ = quit_recv => tlog!("[main] SIGQUIT received, shutting down"),
                    _ = tokio::signal::ctrl_c() => tlog!("[main] SIGINT received, shutting down"),
                }
            }

            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
                tlog!("[main] ctrl-c received, shutting down");
            }
        });

        stop.store(true, Ordering::SeqCst);
    });
}
