use clap::Parser;
use log::{info, warn, LevelFilter};
use polyemu::{
    config::EmuConfig,
    debugger,
    emulator::Emulator,
    errors::EmulatorError,
    parse_key_val, EmuState, RunLimits, RunUntil, StopReason,
};
use serde_json::json;
use std::{num::NonZeroU64, path::PathBuf, time::Duration};

#[derive(Parser)]
struct Options {
    #[clap(long = "config")]
    /// config file of the emulation, defaults apply when omitted.
    config_file: Option<PathBuf>,
    #[clap(subcommand)]
    command: SubCommands,
}

#[derive(Parser)]
enum SubCommands {
    /// Run a program to its end.
    Run {
        /// exec file
        exec: PathBuf,
        args: Vec<String>,
        #[clap(long = "env", parse(try_from_str=parse_key_val))]
        envs: Vec<(String, String)>,
        /// stop after this many instructions.
        #[clap(long)]
        max_instructions: Option<u64>,
        /// stop after this many seconds.
        #[clap(long)]
        timeout: Option<u64>,
    },
    /// Serve the debug protocol for one connection.
    Debug {
        /// exec file
        exec: PathBuf,
        args: Vec<String>,
        #[clap(long = "env", parse(try_from_str=parse_key_val))]
        envs: Vec<(String, String)>,
        #[clap(short, long, default_value = "127.0.0.1:9999")]
        listen: String,
    },
    /// Run N instructions and save the session to a file.
    Snapshot {
        /// exec file
        exec: PathBuf,
        args: Vec<String>,
        #[clap(long = "env", parse(try_from_str=parse_key_val))]
        envs: Vec<(String, String)>,
        #[clap(short, long)]
        steps: NonZeroU64,
        #[clap(short, long)]
        output: PathBuf,
    },
    /// Print what the loader made of a program.
    Inspect {
        /// exec file
        exec: PathBuf,
    },
}

fn load_config(path: Option<&PathBuf>, envs: Vec<(String, String)>) -> Result<EmuConfig, EmulatorError> {
    let mut config = match path {
        Some(path) => EmuConfig::from_toml(&std::fs::read_to_string(path)?)?,
        None => EmuConfig::default(),
    };
    config.env.extend(envs);
    Ok(config)
}

fn guest_argv(exec: &PathBuf, args: Vec<String>) -> Vec<String> {
    let mut a = args;
    let name = exec
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| exec.to_string_lossy().to_string());
    a.insert(0, name);
    a
}

fn main() -> Result<(), EmulatorError> {
    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let opts: Options = Options::parse();

    match opts.command {
        SubCommands::Run {
            exec,
            args,
            envs,
            max_instructions,
            timeout,
        } => {
            let config = load_config(opts.config_file.as_ref(), envs)?;
            let mut emu = Emulator::from_file(config, &exec, &guest_argv(&exec, args))?;
            info!("load info: {:?}", emu.load_info());

            let limits = RunLimits {
                max_instructions,
                timeout: timeout.map(Duration::from_secs),
            };
            let code = emu.run_to_completion(limits)?;
            info!("exit code {}, {} instructions", code, emu.retired());
            emu.teardown();
            std::process::exit(code as i32);
        }
        SubCommands::Debug {
            exec,
            args,
            envs,
            listen,
        } => {
            let config = load_config(opts.config_file.as_ref(), envs)?;
            let emu = Emulator::from_file(config, &exec, &guest_argv(&exec, args))?;
            let mut emu = debugger::serve_tcp(emu, &listen)?;
            info!("final state: {:?}", emu.state());
            emu.teardown();
        }
        SubCommands::Snapshot {
            exec,
            args,
            envs,
            steps,
            output,
        } => {
            let config = load_config(opts.config_file.as_ref(), envs)?;
            let mut emu = Emulator::from_file(config, &exec, &guest_argv(&exec, args))?;
            match emu.run(RunUntil::Count(steps.get()), RunLimits::default())? {
                EmuState::Stopped(StopReason::Fault(report)) => return Err(EmulatorError::Fault(report)),
                state @ EmuState::Stopped(StopReason::Exited { .. }) => {
                    warn!("program ended before {} steps: {:?}", steps, state)
                }
                state => info!("{:?} after {} instructions", state, emu.retired()),
            }
            let head = emu.save_session(&output)?;
            info!("session saved to {} at checkpoint {}", output.display(), head);
        }
        SubCommands::Inspect { exec } => {
            let config = load_config(opts.config_file.as_ref(), vec![])?;
            let emu = Emulator::from_file(config, &exec, &[])?;
            let report = json!({
                "format": emu.format(),
                "arch": emu.machine.arch,
                "os": emu.kernel().os,
                "load_info": emu.load_info(),
                "images": emu.images(),
                "regions": emu.regions(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}
