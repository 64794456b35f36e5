use std::path::PathBuf;

use logmill_core::LogmillError;
use logmill_engine::{Cluster, ClusterStore};
use tabled::settings::Style;
use tabled::{Table, Tabled};

#[derive(Tabled)]
struct TemplateRow {
    #[tabled(rename = "ID")]
    id: u64,
    #[tabled(rename = "Count")]
    count: u64,
    #[tabled(rename = "Tokens")]
    tokens: usize,
    #[tabled(rename = "Last seen")]
    last_seen: String,
    #[tabled(rename = "Template")]
    template: String,
}

impl From<&Cluster> for TemplateRow {
    fn from(c: &Cluster) -> Self {
        Self {
            id: c.id,
            count: c.match_count,
            tokens: c.token_count,
            last_seen: c.last_seen.format("%Y-%m-%d %H:%M:%S").to_string(),
            template: c.template(),
        }
    }
}

pub fn run(
    config: Option<PathBuf>,
    state: Option<PathBuf>,
    limit: Option<usize>,
    json: bool,
) -> Result<(), LogmillError> {
    let config = super::load_config(config.as_deref())?;
    let Some(path) = state.or(config.miner.state_path) else {
        return Err(LogmillError::Config(
            "no cluster store configured; pass --state or set miner.state_path".into(),
        ));
    };

    let mut clusters = ClusterStore::new(&path)
        .load()?
        .map(|snapshot| snapshot.clusters)
        .unwrap_or_default();
    sort_clusters(&mut clusters);
    if let Some(n) = limit {
        clusters.truncate(n);
    }

    if json {
        let out: Vec<_> = clusters
            .iter()
            .map(|c| {
                serde_json::json!({
                    "id": c.id,
                    "template": c.template(),
                    "match_count": c.match_count,
                    "token_count": c.token_count,
                    "last_seen": c.last_seen,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if clusters.is_empty() {
        println!("[logmill] No templates in {}", path.display());
        return Ok(());
    }

    let rows: Vec<TemplateRow> = clusters.iter().map(TemplateRow::from).collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
    Ok(())
}

/// Most frequent first, ties by id.
fn sort_clusters(clusters: &mut [Cluster]) {
    clusters.sort_by(|a, b| b.match_count.cmp(&a.match_count).then(a.id.cmp(&b.id)));
}
