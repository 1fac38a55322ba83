pub mod serve;
pub mod tunnel;

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Run the relay server
    Serve(serve::Args),

    /// Start a tunnel to expose a local server
    Tunnel(tunnel::Args),
}
