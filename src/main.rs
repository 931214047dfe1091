use std::error::Error;
use std::path::PathBuf;

use clap::Parser;
use gdbadapter::{
    BreakpointLocation, DebugEvent, DebuggerConfig, DebuggerState, GdbError, LocalGdbAdapter,
    TargetSpec,
};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(author, version, about = "Line-oriented GDB front end", long_about = None)]
struct Args {
    /// TOML file with debugger settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// GDB executable
    #[arg(long)]
    gdb: Option<String>,

    /// Terminal command prefix, e.g. "xterm -e"
    #[arg(long)]
    terminal: Option<String>,

    /// Working directory of the target
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Extra environment for the target, KEY=VALUE
    #[arg(long = "env", value_parser = parse_env)]
    env: Vec<(String, String)>,

    #[arg(short, long)]
    verbose: bool,

    /// Program and arguments to debug
    #[arg(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {:?}", s))
}

fn load_config(args: &Args) -> Result<DebuggerConfig, Box<dyn Error>> {
    let mut config: DebuggerConfig = match &args.config {
        Some(path) => toml::de::from_str(&std::fs::read_to_string(path)?)?,
        None => DebuggerConfig::default(),
    };

    if let Some(gdb) = &args.gdb {
        config.gdb_path = gdb.clone();
    }
    if let Some(terminal) = &args.terminal {
        config.terminal = terminal.split_whitespace().map(str::to_string).collect();
    }
    Ok(config)
}

fn target_from_args(args: &Args) -> Result<TargetSpec, Box<dyn Error>> {
    let cwd = match &args.cwd {
        Some(cwd) => cwd.clone(),
        None => std::env::current_dir()?,
    };
    let target = args
        .env
        .iter()
        .fold(TargetSpec::new(args.command.join(" "), cwd), |target, (k, v)| {
            target.with_env(k, v)
        });
    Ok(target)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let level = if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    simple_logger::SimpleLogger::new()
        .with_level(level)
        .with_module_level(
            "gdbadapter",
            if args.verbose {
                log::LevelFilter::Trace
            } else {
                log::LevelFilter::Warn
            },
        )
        .init()?;

    log::info!("gdbfront starting...");

    let config = load_config(&args)?;
    let target = target_from_args(&args)?;

    let mut gdb = LocalGdbAdapter::start(config).await?;
    let mut events = gdb.subscribe();

    let pid = gdb.run(target).await?;
    log::info!("Debugging PID {}", pid);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = stdin.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match handle_command(&mut gdb, line.trim()).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => log::error!("{}", e),
                }
            }
            output = gdb.next_output() => match output {
                Ok(_) => {}
                Err(GdbError::CommandError(failed)) => log::error!("{}", failed),
                Err(e) => {
                    log::error!("Lost GDB: {}", e);
                    break;
                }
            },
            Some(event) = events.recv() => print_event(&event),
        }
    }

    gdb.shutdown().await?;
    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }
    log::info!("gdbfront exited");
    Ok(())
}

fn print_event(event: &DebugEvent) {
    match serde_json::to_string(event) {
        Ok(json) => println!("{}", json),
        Err(e) => log::warn!("Cannot serialize event {:?}: {}", event, e),
    }
}

/// Run one console command; `false` ends the session
async fn handle_command(gdb: &mut LocalGdbAdapter, line: &str) -> Result<bool, GdbError> {
    let (command, arg) = match line.split_once(' ') {
        Some((command, arg)) => (command, arg.trim()),
        None => (line, ""),
    };

    match command {
        "" => {}
        "s" | "step" => {
            gdb.step_into().await?;
        }
        "n" | "next" => {
            gdb.step_over().await?;
        }
        "si" | "stepi" => {
            gdb.step_instruction().await?;
        }
        "ni" | "nexti" => {
            gdb.next_instruction().await?;
        }
        "finish" => {
            gdb.finish().await?;
        }
        "c" | "continue" => {
            gdb.continue_execution().await?;
        }
        "int" | "interrupt" => gdb.interrupt()?,
        "b" | "break" => match parse_location(arg) {
            Some(location) => {
                let bp = gdb.insert_breakpoint(location).await?;
                log::info!("Breakpoint {} set", bp.number);
            }
            None => log::warn!("Usage: b FILE:LINE | FUNCTION | *ADDRESS"),
        },
        "d" | "delete" => match arg.parse() {
            Ok(number) => gdb.delete_breakpoint(number).await?,
            Err(_) => log::warn!("Usage: d NUMBER"),
        },
        "bt" | "backtrace" => {
            if gdb.state() == DebuggerState::Interrupted {
                gdb.refresh_stack().await?;
            }
            for frame in gdb.stack() {
                println!(
                    "#{} {:#018x} in {} {}:{}",
                    frame.level,
                    frame.address,
                    frame.function,
                    frame.fullname.as_deref().unwrap_or("??"),
                    frame.line.map(|l| l.to_string()).unwrap_or_default()
                );
            }
        }
        "restart" => {
            let pid = gdb.restart().await?;
            log::info!("Restarted as PID {}", pid);
        }
        "q" | "quit" => return Ok(false),
        other => log::warn!("Unknown command {:?}", other),
    }
    Ok(true)
}

fn parse_location(arg: &str) -> Option<BreakpointLocation> {
    if arg.is_empty() {
        return None;
    }
    if let Some(addr) = arg.strip_prefix('*') {
        let digits = addr.trim_start_matches("0x");
        return u64::from_str_radix(digits, 16)
            .ok()
            .map(BreakpointLocation::Address);
    }
    if let Some((file, line)) = arg.rsplit_once(':') {
        if let Ok(line) = line.parse() {
            return Some(BreakpointLocation::Line {
                file: file.to_string(),
                line,
            });
        }
    }
    Some(BreakpointLocation::Function(arg.to_string()))
}
