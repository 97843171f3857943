use crate::error::CliError;
use engine_core::{
    lease::cluster::LeaseSchema,
    progress::{ItemProgress, ProgressSummary},
};
use model::{core::version::ClusterVersion, work::lease::LeaseState};
use serde::Serialize;
use serde_json::json;

#[derive(Serialize)]
pub struct StatusReport {
    pub summary: ProgressSummary,
    pub items: Vec<ItemProgress>,
}

pub fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{json}");
    Ok(())
}

pub fn print_status_table(report: &StatusReport) {
    let s = &report.summary;
    println!(
        "{} work items: {} completed, {} leased, {} expired, {} unassigned",
        s.total, s.completed, s.leased, s.expired, s.unassigned
    );
    println!("{:<16} {}", "Docs acknowledged", s.docs_acknowledged);
    println!();
    println!(
        "{:<40} {:<10} {:<44} {:<26} {:>10} {:>4}",
        "Work item", "State", "Holder", "Expiry", "Position", "Exp"
    );

    for item in &report.items {
        let (holder, expiry) = match &item.state {
            LeaseState::Leased { holder, expiry } | LeaseState::Expired { holder, expiry } => {
                (holder.as_str(), expiry.to_rfc3339())
            }
            LeaseState::Completed { at } => ("-", format!("done {}", at.to_rfc3339())),
            LeaseState::Unassigned => ("-", "-".to_string()),
        };
        println!(
            "{:<40} {:<10} {:<44} {:<26} {:>10} {:>4}",
            item.work_item.key(),
            item.state.as_str(),
            holder,
            expiry,
            item.acknowledged_position,
            item.next_acquisition_exponent
        );
    }
}

pub fn print_probe(
    url: &str,
    version: &ClusterVersion,
    schema: Option<LeaseSchema>,
    as_json: bool,
) -> Result<(), CliError> {
    let layout = match schema {
        Some(LeaseSchema::Typeless) => "typeless".to_string(),
        Some(LeaseSchema::Typed { type_name }) => format!("typed ({type_name})"),
        None => "unsupported".to_string(),
    };

    if as_json {
        return print_json(&json!({
            "url": url,
            "version": version,
            "lease_layout": layout,
            "accepts_compressed_requests": version.accepts_compressed_requests(),
        }));
    }

    println!("{:<16} {}", "Cluster", url);
    println!("{:<16} {}", "Version", version);
    println!("{:<16} {}", "Lease layout", layout);
    println!("{:<16} {}", "Compression", version.accepts_compressed_requests());
    Ok(())
}
