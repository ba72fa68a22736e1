//! # TPM command line tool
//!
//! Reads and writes the registers of FPGA digital boards over UCP, and runs an emulated
//! board for development without hardware.
//!
//! Registers are named by their qualified name, e.g. `fpga1.regfile.ctrl`, and resolved
//! through the register map given with `--map`.
use std::error::Error;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use env_logger::Env;
use tpm_access::{Board, Device, register_map::RegisterMap};
use ucp_emulator::{RegisterFile, server::Builder as ServerBuilder};

#[derive(Subcommand, Eq, PartialEq, Clone)]
enum Command {
    /// Read words of a register
    Read {
        /// Qualified register name, e.g. fpga1.regfile.ctrl
        register: String,
        #[arg(short, long, default_value = "1")]
        count: usize,
        #[arg(short, long, default_value = "0")]
        offset: usize,
    },
    /// Write words to a register
    Write {
        register: String,
        #[arg(value_parser = maybe_hex::<u32>, num_args = 1.., required = true)]
        values: Vec<u32>,
        #[arg(short, long, default_value = "0")]
        offset: usize,
    },
    /// Read words at a raw address
    ReadAddress {
        #[arg(value_parser = maybe_hex::<u32>)]
        address: u32,
        #[arg(short, long, default_value = "1")]
        count: usize,
    },
    /// Write words at a raw address
    WriteAddress {
        #[arg(value_parser = maybe_hex::<u32>)]
        address: u32,
        #[arg(value_parser = maybe_hex::<u32>, num_args = 1.., required = true)]
        values: Vec<u32>,
    },
    /// List the registers of all or one device
    List { device: Option<Device> },
    /// List the registers whose name contains a pattern
    Find { pattern: String },
    /// Reset the board
    Reset,
    /// Program a firmware image into the flash of a device
    LoadFirmware {
        device: Device,
        /// Firmware image. The register description is read from the same path with a
        /// .toml extension.
        image: PathBuf,
    },
    /// Serve an emulated board on the given address until interrupted
    Emulate {
        /// Drop the first datagrams to exercise client retries
        #[arg(long, default_value = "0")]
        drop_first: usize,
        /// Precede every reply by a stale one
        #[arg(long)]
        stale_replies: bool,
    },
}

#[derive(Parser)]
#[command(about = "Register access for FPGA digital boards over UCP", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "10000")]
    port: u16,

    #[arg(short, long, default_value = "127.0.0.1")]
    ip: IpAddr,

    /// How long to wait for each reply
    #[arg(long, default_value = "2000")]
    timeout_ms: u64,

    /// How often an unanswered command is resent
    #[arg(long, default_value = "3")]
    retries: u32,

    #[arg(long, default_value = "1500")]
    mtu: usize,

    /// Register map in TOML format
    #[arg(short, long)]
    map: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

fn print_words(address: Option<u32>, values: &[u32]) {
    for (i, value) in values.iter().enumerate() {
        match address {
            Some(address) => println!("0x{:08x}: 0x{:08x}", address.wrapping_add(i as u32), value),
            None => println!("[{}] 0x{:08x}", i, value),
        }
    }
}

fn qualified(name: &str) -> Result<(Device, &str), String> {
    Device::split_qualified(name)
        .ok_or_else(|| format!("'{}' is not of the form <device>.<register>", name))
}

fn emulate(addr: SocketAddr, drop_first: usize, stale_replies: bool) -> Result<(), Box<dyn Error>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let server = ServerBuilder::new()
        .drop_first(drop_first)
        .stale_replies(stale_replies)
        .build(RegisterFile::new());
    runtime.block_on(async {
        let socket = tokio::net::UdpSocket::bind(addr).await?;
        server
            .serve_until(socket, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    log::error!("Cannot listen for Ctrl-C: {}", e);
                    std::future::pending::<()>().await;
                }
            })
            .await
    })?;
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let addr = SocketAddr::new(args.ip, args.port);
    log::debug!("Parsed arguments: ip={}, port={}", args.ip, args.port);

    if let Command::Emulate {
        drop_first,
        stale_replies,
    } = args.command
    {
        return emulate(addr, drop_first, stale_replies);
    }

    let map = match &args.map {
        Some(path) => RegisterMap::from_file(path)?,
        None => RegisterMap::default(),
    };
    let mut board = Board::new(map);

    match &args.command {
        Command::List { device } => {
            let devices = match device {
                Some(device) => vec![*device],
                None => Device::ALL.to_vec(),
            };
            for device in devices {
                for register in board.list_registers(device) {
                    println!(
                        "0x{:08x} {:>4} {:<10} {:<8} {}",
                        register.address(),
                        register.element_count(),
                        register.permission(),
                        register.kind(),
                        register.qualified_name()
                    );
                }
            }
            return Ok(());
        }
        Command::Find { pattern } => {
            for register in board.find_registers(pattern) {
                println!("{}", register.qualified_name());
            }
            return Ok(());
        }
        _ => {}
    }

    let config = ucp_client::Builder::new()
        .timeout(Duration::from_millis(args.timeout_ms))
        .retries(args.retries)
        .mtu(args.mtu)
        .build();
    board.connect(addr, config)?;

    match args.command {
        Command::Read {
            register,
            count,
            offset,
        } => {
            let (device, name) = qualified(&register)?;
            print_words(None, &board.read_register(device, name, count, offset)?);
        }
        Command::Write {
            register,
            values,
            offset,
        } => {
            let (device, name) = qualified(&register)?;
            board.write_register(device, name, &values, offset)?;
        }
        Command::ReadAddress { address, count } => {
            print_words(Some(address), &board.read_address(address, count)?);
        }
        Command::WriteAddress { address, values } => {
            board.write_address(address, &values)?;
        }
        Command::Reset => board.reset()?,
        Command::LoadFirmware { device, image } => {
            board.load_firmware_blocking(device, image)?;
            println!(
                "Installed {} registers for {}",
                board.list_registers(device).len(),
                device
            );
        }
        Command::List { .. } | Command::Find { .. } | Command::Emulate { .. } => {}
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn numbers_accept_hex() {
        let args = Args::try_parse_from(["tpm", "write-address", "0x100", "0xA5", "7"]).unwrap();
        assert!(
            args.command
                == Command::WriteAddress {
                    address: 0x100,
                    values: vec![0xA5, 7]
                }
        );
        assert_eq!(args.port, 10000);
        assert_eq!(args.retries, 3);
    }

    #[test]
    fn write_needs_values() {
        assert!(Args::try_parse_from(["tpm", "write", "fpga1.regfile.ctrl"]).is_err());
    }

    #[test]
    fn list_takes_a_device() {
        let args = Args::try_parse_from(["tpm", "--map", "map.toml", "list", "FPGA2"]).unwrap();
        assert!(
            args.command
                == Command::List {
                    device: Some(Device::Fpga2)
                }
        );
        assert_eq!(args.map, Some(PathBuf::from("map.toml")));
    }

    #[test]
    fn firmware_takes_device_and_image() {
        let args =
            Args::try_parse_from(["tpm", "load-firmware", "fpga1", "build/tpm.bit"]).unwrap();
        assert!(
            args.command
                == Command::LoadFirmware {
                    device: Device::Fpga1,
                    image: PathBuf::from("build/tpm.bit")
                }
        );
    }

    #[test]
    fn register_names_are_qualified() {
        assert_eq!(
            qualified("fpga1.regfile.coeffs"),
            Ok((Device::Fpga1, "regfile.coeffs"))
        );
        assert!(qualified("coeffs").is_err());
    }
}
