use std::net::SocketAddr;

use clap::Parser;

use crate::crypto::DEFAULT_HASH_ITERATIONS;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:4321";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = DEFAULT_LISTEN_ADDR)]
    pub listen: SocketAddr,

    /// PBKDF2 iteration count used when hashing newly submitted secrets.
    #[arg(long, default_value_t = DEFAULT_HASH_ITERATIONS)]
    pub hash_iterations: u32,
}
