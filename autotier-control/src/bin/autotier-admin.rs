use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use autotier_control::{Request, Response, StatusFormat};
use autotier_core::Config;
use clap::{Parser, Subcommand};

const EXIT_PIPE_UNREACHABLE: u8 = 126;

#[derive(Debug, Parser)]
#[command(name = "autotier-admin", about = "Administrative CLI for an autotier mount", version)]
struct Cli {
    /// Path to the autotier config file.
    #[arg(short = 'c', long, global = true, default_value = "/etc/autotier.conf")]
    config: PathBuf,

    /// Suppress informational output.
    #[arg(short = 'q', long, global = true)]
    quiet: bool,

    /// Verbose output.
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Trigger an immediate tiering pass.
    Oneshot,
    /// Pin one or more paths to a named tier.
    Pin {
        tier_id: String,
        paths: Vec<String>,
    },
    /// Clear the pin on one or more paths.
    Unpin { paths: Vec<String> },
    /// Report per-tier capacity/quota/usage and the conflict list.
    Status {
        #[arg(default_value = "table")]
        format: String,
    },
    /// Dump the effective configuration.
    Config,
    /// List all pinned paths.
    ListPins,
    /// List every path's current popularity score.
    ListPopularity,
    /// Resolve paths to their owning tier.
    WhichTier { paths: Vec<String> },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let request = match build_request(&cli.command) {
        Ok(r) => r,
        Err(e) => {
            println!("ERR {e}");
            return ExitCode::FAILURE;
        }
    };

    let config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            println!("ERR {e}");
            return ExitCode::FAILURE;
        }
    };
    let run_path = config.run_path();

    match send_request(&run_path, &request) {
        Ok(response) => {
            for line in &response.lines {
                println!("{line}");
            }
            if response.ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(PipeError::Unreachable(e)) => {
            println!("ERR control pipe unreachable: {e}");
            ExitCode::from(EXIT_PIPE_UNREACHABLE)
        }
        Err(PipeError::Other(e)) => {
            println!("ERR {e}");
            ExitCode::FAILURE
        }
    }
}

fn build_request(command: &Commands) -> Result<Request, String> {
    Ok(match command {
        Commands::Oneshot => Request::Oneshot,
        Commands::Pin { tier_id, paths } => {
            if paths.is_empty() {
                return Err("pin requires at least one path".to_string());
            }
            Request::Pin {
                tier_id: tier_id.clone(),
                paths: paths.clone(),
            }
        }
        Commands::Unpin { paths } => {
            if paths.is_empty() {
                return Err("unpin requires at least one path".to_string());
            }
            Request::Unpin { paths: paths.clone() }
        }
        Commands::Status { format } => Request::Status(match format.as_str() {
            "json" => StatusFormat::Json,
            _ => StatusFormat::Table,
        }),
        Commands::Config => Request::Config,
        Commands::ListPins => Request::ListPins,
        Commands::ListPopularity => Request::ListPopularity,
        Commands::WhichTier { paths } => {
            if paths.is_empty() {
                return Err("which-tier requires at least one path".to_string());
            }
            Request::WhichTier { paths: paths.clone() }
        }
    })
}

enum PipeError {
    Unreachable(std::io::Error),
    Other(std::io::Error),
}

fn send_request(run_path: &std::path::Path, request: &Request) -> Result<Response, PipeError> {
    let request_path = run_path.join("request.pipe");
    let response_path = run_path.join("response.pipe");

    let mut req_file = OpenOptions::new()
        .write(true)
        .open(&request_path)
        .map_err(PipeError::Unreachable)?;
    writeln!(req_file, "{}", request.encode()).map_err(PipeError::Other)?;
    drop(req_file);

    // A short grace period lets the daemon's control thread open its end of
    // the response pipe for write before we open ours for read.
    std::thread::sleep(Duration::from_millis(20));

    let resp_file = OpenOptions::new()
        .read(true)
        .open(&response_path)
        .map_err(PipeError::Unreachable)?;
    let mut reader = BufReader::new(resp_file);
    let mut payload = String::new();
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).map_err(PipeError::Other)?;
        if n == 0 {
            break;
        }
        payload.push_str(line.trim_end_matches('\n'));
        payload.push('\n');
    }
    Ok(Response::decode(payload.trim_end_matches('\n')))
}
