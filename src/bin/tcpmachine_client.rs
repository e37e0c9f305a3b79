use std::error::Error;

use clap::Parser;
use tcpmachine::Client;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server host name or address
    host: String,
    /// Server port
    port: u16,
    /// Integer to send
    #[arg(short, long, default_value_t = 42)]
    value: i32,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let mut client = Client::connect(&cli.host, cli.port)?;

    client.send_i32(cli.value)?;
    let reply = client.recv_string()?;
    println!("{}", String::from_utf8_lossy(&reply));

    Ok(())
}
