//! Entrypoint for CLI
use std::{
    env,
    error::Error,
    fs,
    time::{Duration, Instant},
};

use chip8_interp::{constants::*, prelude::*, Flow, KeyCode, Op, RunState, IMPL_VERSION};
use log::{debug, error, info, warn};
use serde::Deserialize;

static USAGE: &str = r#"
usage: chip8 CMD FILE [CONFIG]

commands:
    run     Run the target ROM file headless and print the final display
    dis     Disassemble the target ROM into readable assembly

options:
    CONFIG  YAML file with machine settings, see configs/default.yaml

environment:
    RUST_LOG    Log level filter, for example `RUST_LOG=debug`

examples:
    chip8 run maze.ch8
    chip8 run breakout.ch8 configs/default.yaml
    chip8 dis breakout.ch8
"#;

/// Settings for a headless run.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct RunConf {
    vm: Chip8Conf,
    /// Frames of emulated time before the run is cut off.
    max_frames: u64,
    /// Keys pressed whenever the program waits for input.
    keys: Vec<KeyCode>,
}

impl Default for RunConf {
    fn default() -> Self {
        Self {
            vm: Chip8Conf::default(),
            max_frames: 600,
            keys: Vec::new(),
        }
    }
}

impl RunConf {
    fn from_file(filepath: &str) -> Result<Self, Box<dyn Error>> {
        let file = fs::File::open(filepath)?;
        let conf: RunConf = serde_yaml::from_reader(file)?;
        debug!("loaded run configuration: {conf:#?}");
        Ok(conf)
    }
}

/// Emulated time per frame of the driving loop.
const FRAME_TIME: Duration = Duration::from_nanos(CLOCK_CYCLE_TIME);

fn run_bytecode(filepath: &str, conf_path: Option<&str>) -> Result<(), Box<dyn Error>> {
    let conf = match conf_path {
        Some(path) => RunConf::from_file(path)?,
        None => RunConf::default(),
    };

    let bytecode = fs::read(filepath)?;
    info!("running {filepath} ({} bytes)", bytecode.len());

    let mut vm = Chip8Vm::new(conf.vm.clone());
    vm.load_bytecode(bytecode.as_slice())?;

    let start = Instant::now();
    let result = run_frames(&mut vm, &conf);
    let end = Instant::now();

    info!(
        "time taken: {}ms",
        end.duration_since(start).as_nanos() as f64 / 1000000.0
    ); // to millis
    println!("{}", vm.dump_display()?);

    if let Err(err) = result {
        error!("stopped at 0x{:03X}\n{}", vm.pc(), vm.dump_ram(0x40)?);
        return Err(err.into());
    }

    Ok(())
}

/// Drive the machine one emulated frame at a time until it idles,
/// stops or runs out of frames.
fn run_frames(vm: &mut Chip8Vm, conf: &RunConf) -> Chip8Result<()> {
    let mut buzzing = false;

    for frame in 0..conf.max_frames {
        let flow = vm.run_for(FRAME_TIME)?;

        if vm.is_buzzing() != buzzing {
            buzzing = vm.is_buzzing();
            debug!("frame {frame}: buzzer {}", if buzzing { "on" } else { "off" });
        }

        match (flow, vm.state()) {
            (_, RunState::Stopped) => {
                info!("machine stopped after {frame} frames");
                return Ok(());
            }
            (_, RunState::AwaitingKey { vx }) => {
                if conf.keys.is_empty() {
                    warn!("program waits for a key in v{vx:X}, none configured");
                    return Ok(());
                }
                // Keys must go down while the machine waits.
                for key in conf.keys.iter().copied() {
                    vm.set_key(key, false);
                    vm.set_key(key, true);
                }
                debug!("frame {frame}: {}", vm.dump_keys()?);
            }
            (Flow::Skipped { address, instr }, _) => {
                debug!("frame {frame}: skipped 0x{instr:04X} at 0x{address:03X}");
            }
            _ => {}
        }

        // A jump onto itself never makes progress.
        if vm.current_op() == Some(Op::JumpAddress { address: vm.pc() }) {
            info!("program idle at 0x{:03X} after {frame} frames", vm.pc());
            return Ok(());
        }
    }

    warn!("stopped after {} frames", conf.max_frames);
    Ok(())
}

fn run_disassembler(filepath: &str) -> Result<(), Box<dyn Error>> {
    let bytecode = fs::read(filepath)?;
    print!("{}", Disassembler::new(bytecode.as_slice()).to_text()?);
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .env()
        .init()?;

    match parse_args() {
        Some(Cmd::Run { filepath, config }) => run_bytecode(&filepath, config.as_deref())?,
        Some(Cmd::Dis { filepath }) => run_disassembler(&filepath)?,
        None => {
            print_usage();
            // FreeBSD EX_USAGE (64)
            std::process::exit(64)
        }
    }

    Ok(())
}

fn parse_args() -> Option<Cmd> {
    let mut args = env::args().skip(1);
    let cmd = args.next()?;

    match cmd.as_str() {
        "run" => Some(Cmd::Run {
            filepath: args.next()?,
            config: args.next(),
        }),
        "dis" => Some(Cmd::Dis {
            filepath: args.next()?,
        }),
        _ => None,
    }
}

fn print_usage() {
    println!("Chip8 v{IMPL_VERSION}");
    println!("{USAGE}");
}

enum Cmd {
    /// Run file
    Run {
        filepath: String,
        config: Option<String>,
    },
    /// Disassemble
    Dis { filepath: String },
}
