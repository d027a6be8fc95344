//! armctl - CLI for armd
//!
//! Communicates with the armd daemon over its control socket.

use armd::activation::StopResult;
use armd::launcher::ServiceStatus;
use armd::protocol::{default_socket_path, Request, Response};
use clap::{Parser, Subcommand};
use peercred_ipc::Client;

#[derive(Parser)]
#[command(name = "armctl")]
#[command(about = "Control the armd activation daemon")]
struct Args {
    /// Control socket path
    #[arg(long, global = true)]
    socket: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List monitored addresses
    List,

    /// Start a service now
    Start {
        /// Service name
        name: String,
    },

    /// Stop a service and stop monitoring its addresses
    Stop {
        /// Service name
        name: String,
    },

    /// Stop monitoring a service so it can be started by other means
    StopListening {
        /// Service name (all services when omitted)
        name: Option<String>,
    },

    /// Ping the daemon
    Ping,
}

fn main() {
    let args = Args::parse();

    let request = match args.command {
        Command::List => Request::List,
        Command::Start { name } => Request::Start { service: name },
        Command::Stop { name } => Request::Stop { service: name },
        Command::StopListening { name } => Request::StopListening { service: name },
        Command::Ping => Request::Ping,
    };

    let sock_path = args.socket.unwrap_or_else(default_socket_path);

    match Client::call(&sock_path, &request) {
        Ok(response) => print_response(response),
        Err(e) => {
            if e.to_string().contains("connect") || e.to_string().contains("No such file") {
                eprintln!("armctl: daemon not running at {}", sock_path);
                eprintln!("  start with: armd -c <config>");
            } else {
                eprintln!("armctl: {}", e);
            }
            std::process::exit(1);
        }
    }
}

fn print_response(response: Response) {
    match response {
        Response::Pong => println!("pong"),
        Response::Error(msg) => {
            eprintln!("error: {}", msg);
            std::process::exit(1);
        }
        Response::Status { service, status } => match status {
            ServiceStatus::Up => println!("{} is up", service),
            ServiceStatus::Down => println!("{} is down", service),
        },
        Response::Stopped(StopResult::RemovedSome) => println!("stopped listening"),
        Response::Stopped(StopResult::RemovedNone) => {
            eprintln!("nothing was being monitored");
            std::process::exit(1);
        }
        Response::Listening(entries) => {
            if entries.is_empty() {
                println!("No addresses monitored");
                return;
            }
            println!("{:<20} {:<10} ADDRESS", "SERVICE", "STRATEGY");
            for entry in entries {
                println!(
                    "{:<20} {:<10} {}",
                    entry.service,
                    entry.strategy.to_string(),
                    entry.address
                );
            }
        }
    }
}
