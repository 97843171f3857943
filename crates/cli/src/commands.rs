use clap::Subcommand;

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Create an unassigned lease record for every shard of the configured indices
    Init,
    /// Work shards until none is claimable or the lease time runs out
    Run {
        #[arg(long, help = "Worker identity; a fresh one is generated when absent")]
        worker_id: Option<String>,
    },
    Status {
        #[arg(
            long,
            help = "If set, prints the progress information as JSON instead of a table"
        )]
        json: bool,
    },
    /// Print the version and lease layout of a cluster
    Probe {
        #[arg(long, help = "Cluster url; defaults to the configured target")]
        url: Option<String>,

        #[arg(long, help = "If set, prints the result as JSON")]
        json: bool,
    },
}
