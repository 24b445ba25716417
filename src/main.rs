use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use clap::Subcommand;
use clap_verbosity_flag::InfoLevel;
use clap_verbosity_flag::Verbosity;
use indicatif::MultiProgress;
use indicatif::ProgressBar;
use indicatif::ProgressStyle;
use indicatif_log_bridge::LogWrapper;
use serde::Serialize;

use cochange::cluster;
use cochange::cluster::GraphView;
use cochange::errors::Error;
use cochange::options::AnalysisOptions;
use cochange::options::BulkPolicy;
use cochange::options::MergePolicy;
use cochange::orchestrator::RunState;
use cochange::query::FilesQuery;
use cochange::registry::Registry;
use cochange::snapshot::SnapshotStore;

const DATA_DIR_ENV: &str = "COCHANGE_DATA_DIR";
const DEFAULT_DATA_DIR: &str = ".cochange";
const DEFAULT_REPO: &str = "default";

/// Discover logically coupled files from version control history
///
/// `analyze` mirrors a repository and builds its co-change catalog; every
/// other subcommand queries a previously built catalog and prints one JSON
/// document on stdout.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Root directory for mirrors and catalogs
    ///
    /// Defaults to `$COCHANGE_DATA_DIR`, then `./.cochange`.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Repository name within the data dir
    #[arg(long, default_value = DEFAULT_REPO)]
    repo: String,

    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Mirror a repository and run the full analysis
    Analyze {
        /// Path or URL of the repository to analyze
        source: String,

        /// Minimum similarity (0-100) for rename stitching
        #[arg(long, default_value_t = 80)]
        rename_similarity_threshold: u32,

        /// How merge commits are counted
        #[arg(long, default_value_t = MergePolicy::Include)]
        merge_policy: MergePolicy,

        /// Weight of merge changes under the downweight policy
        #[arg(long, default_value_t = 0.5)]
        merge_weight: f64,

        /// Changesets larger than this follow the bulk policy
        #[arg(long, default_value_t = 50)]
        max_changeset_size: usize,

        /// What happens to oversized changesets
        #[arg(long, default_value_t = BulkPolicy::Drop)]
        bulk_policy: BulkPolicy,

        /// Files with fewer counted revisions leave the graph
        #[arg(long, default_value_t = 5)]
        min_revisions: u64,

        /// Pairs co-changing fewer times leave the graph
        #[arg(long, default_value_t = 5)]
        min_cooccurrence: u64,

        /// Strongest edges kept per file
        #[arg(long, default_value_t = 50)]
        topk_edges_per_file: usize,

        /// Folder aggregates below this co-change count are dropped
        #[arg(long, default_value_t = 5)]
        min_component_cooccurrence: u64,
    },

    /// List registered repositories
    Repos,

    /// Delete a repository and tombstone its artifacts
    DeleteRepo,

    /// Progress of the repository's analysis run
    Status,

    /// Files coupled to the given path
    Coupling {
        path: String,

        /// Ordering metric
        #[arg(long, default_value = "jaccard")]
        metric: String,

        #[arg(long, default_value_t = 0.0)]
        min_weight: f64,

        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// Only files that exist at HEAD
        #[arg(long)]
        current_only: bool,
    },

    /// Neighborhood graph around the given path
    Graph {
        path: String,

        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Commits in which two files changed together
    Evidence { src_path: String, dst_path: String },

    /// Metadata and coupling summary of one file
    File { path: String },

    /// Commits that touched one file, newest first
    History {
        path: String,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Rename chain of one file
    Lineage { path: String },

    /// Contributors of one file, with its bus factor
    Authors { path: String },

    /// Commits per month for one file
    Activity { path: String },

    /// List files with sorting, paging, and filters
    Files {
        #[arg(long, default_value = "path")]
        sort_by: String,

        #[arg(long, default_value = "asc")]
        sort_dir: String,

        #[arg(long, default_value_t = 0)]
        offset: u64,

        #[arg(long, default_value_t = 50)]
        limit: u64,

        /// Folder prefix (whole path segments)
        #[arg(long)]
        prefix: Option<String>,

        /// Case-insensitive substring match
        #[arg(long)]
        search: Option<String>,

        #[arg(long)]
        current_only: bool,
    },

    /// Folder aggregates at a prefix depth
    Folders {
        #[arg(long, default_value_t = 1)]
        depth: u32,
    },

    /// Aggregates for one folder
    Folder { path: String },

    /// Valid component identifiers at a depth
    Components {
        #[arg(long, default_value_t = 1)]
        depth: u32,
    },

    /// Folder-level coupling aggregates
    Modules {
        #[arg(long, default_value_t = 1)]
        depth: u32,
    },

    /// Catalog-wide statistics and the thresholds in effect
    Stats,

    /// Files ranked by unfiltered commit count
    Hotspots {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// List the clustering algorithms and their parameters
    Algorithms,

    /// Run a clustering algorithm over the coupling graph
    Cluster {
        /// louvain, hierarchical, dbscan, label_propagation, or
        /// connected_components
        algorithm: String,

        /// Algorithm parameter as key=value; repeatable
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Restrict the graph to one folder prefix
        #[arg(long)]
        prefix: Option<String>,

        /// Persist the result as a named snapshot
        #[arg(long)]
        save: Option<String>,

        #[arg(long)]
        description: Option<String>,

        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// List stored clustering snapshots
    Snapshots,

    /// Show one snapshot with its clusters and enrichments
    Snapshot { id: i64 },

    /// Intra-cluster edges of one snapshot
    SnapshotEdges { id: i64 },

    /// Rename or retag a snapshot
    UpdateSnapshot {
        id: i64,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        description: Option<String>,

        #[arg(long = "tag")]
        tags: Option<Vec<String>>,
    },

    /// Delete a snapshot
    DeleteSnapshot { id: i64 },

    /// Compare two snapshots
    Compare { a: i64, b: i64 },
}

fn main() {
    let cli = Cli::parse();

    let logger = env_logger::Builder::new().filter_level(cli.verbose.log_level_filter()).build();
    let progress = MultiProgress::new();
    LogWrapper::new(progress.clone(), logger).try_init().unwrap();

    if let Err(e) = run(cli, &progress) {
        let envelope = serde_json::json!({
            "error": { "code": e.code(), "message": e.to_string() }
        });
        eprintln!("{}", envelope);
        std::process::exit(e.exit_code());
    }
}

fn run(cli: Cli, progress: &MultiProgress) -> Result<(), Error> {
    let data_dir = cli
        .data_dir
        .or_else(|| std::env::var(DATA_DIR_ENV).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));

    let registry = Registry::open(&data_dir)?;
    let repo = cli.repo.as_str();

    match cli.command {
        Command::Analyze {
            source,
            rename_similarity_threshold,
            merge_policy,
            merge_weight,
            max_changeset_size,
            bulk_policy,
            min_revisions,
            min_cooccurrence,
            topk_edges_per_file,
            min_component_cooccurrence,
        } => {
            let options = AnalysisOptions {
                rename_similarity_threshold,
                merge_policy,
                merge_weight,
                max_changeset_size,
                bulk_policy,
                min_revisions,
                min_cooccurrence,
                topk_edges_per_file,
                min_component_cooccurrence,
            };

            registry.upsert_repository(repo, &source)?;
            registry.start_analysis(repo, options)?;

            let bar = progress.add(ProgressBar::new(100)).with_style(
                ProgressStyle::with_template("[{elapsed_precise}] {bar:40} {pos}% {msg}")
                    .expect("static template"),
            );

            loop {
                let status = registry.run_status(repo)?;
                bar.set_position(status.percent as u64);
                bar.set_message(format!(
                    "{} ({} commits, {} files)",
                    status.stage.map(|s| s.to_string()).unwrap_or_default(),
                    status.commits,
                    status.files
                ));

                if status.state == RunState::Complete || status.state == RunState::Failed {
                    break;
                }

                std::thread::sleep(Duration::from_millis(100));
            }

            bar.finish();
            progress.remove(&bar);

            let status = registry.wait_for_run(repo)?;
            if status.state == RunState::Failed {
                let failure = status.error.clone().map(|e| e.message).unwrap_or_default();
                print_json(&status)?;
                return Err(Error::internal(format!("analysis failed: {}", failure)));
            }

            print_json(&status)
        }

        Command::Repos => print_json(&registry.list_repositories()?),

        Command::DeleteRepo => {
            let tombstone = registry.delete_repository(repo)?;
            print_json(&serde_json::json!({ "deleted": repo, "tombstone": tombstone }))
        }

        Command::Status => print_json(&registry.run_status(repo)?),

        Command::Coupling { path, metric, min_weight, limit, current_only } => {
            let metric = cochange::query::parse_metric(&metric)?;
            let engine = registry.query_engine(repo)?;
            print_json(&engine.coupling(&path, metric, min_weight, limit, current_only)?)
        }

        Command::Graph { path, limit } => {
            let engine = registry.query_engine(repo)?;
            print_json(&engine.coupling_graph(&path, limit)?)
        }

        Command::Evidence { src_path, dst_path } => {
            let engine = registry.query_engine(repo)?;
            let src = resolve(&engine, &src_path)?;
            let dst = resolve(&engine, &dst_path)?;
            print_json(&engine.coupling_evidence(src, dst)?)
        }

        Command::File { path } => {
            print_json(&registry.query_engine(repo)?.file_details(&path)?)
        }

        Command::History { path, limit } => {
            print_json(&registry.query_engine(repo)?.file_history(&path, limit)?)
        }

        Command::Lineage { path } => {
            print_json(&registry.query_engine(repo)?.file_lineage(&path)?)
        }

        Command::Authors { path } => {
            print_json(&registry.query_engine(repo)?.file_authors(&path)?)
        }

        Command::Activity { path } => {
            print_json(&registry.query_engine(repo)?.file_activity(&path)?)
        }

        Command::Files { sort_by, sort_dir, offset, limit, prefix, search, current_only } => {
            let query = FilesQuery {
                sort_by: cochange::query::parse_sort_by(&sort_by)?,
                sort_dir: cochange::query::parse_sort_dir(&sort_dir)?,
                offset,
                limit,
                prefix,
                search,
                current_only,
            };
            print_json(&registry.query_engine(repo)?.files(&query)?)
        }

        Command::Folders { depth } => print_json(&registry.query_engine(repo)?.folders(depth)?),

        Command::Folder { path } => {
            print_json(&registry.query_engine(repo)?.folder_details(&path)?)
        }

        Command::Components { depth } => {
            print_json(&registry.query_engine(repo)?.list_components(depth)?)
        }

        Command::Modules { depth } => print_json(&registry.query_engine(repo)?.modules(depth)?),

        Command::Stats => print_json(&registry.query_engine(repo)?.stats()?),

        Command::Hotspots { limit } => {
            print_json(&registry.query_engine(repo)?.hotspots(limit)?)
        }

        Command::Algorithms => print_json(&algorithm_catalog()),

        Command::Cluster { algorithm, params, prefix, save, description, tags } => {
            let algorithm = cluster::parse_algorithm(&algorithm)?;
            let bag = parse_param_bag(&params)?;
            let resolved = cluster::Params::parse(algorithm, &bag)?;

            let engine = registry.query_engine(repo)?;
            let view = GraphView::load(
                engine.catalog(),
                prefix.as_deref(),
                resolved.min_weight(),
            )?;
            let result = cluster::run(&view, algorithm, &resolved)?;

            if let Some(name) = save {
                let store = SnapshotStore::new(engine.catalog());
                let id = store.save(&name, &result, description.as_deref(), &tags)?;
                return print_json(&store.get(id)?);
            }

            print_json(&render_clusters(&view, &result))
        }

        Command::Snapshots => {
            let engine = registry.query_engine(repo)?;
            print_json(&SnapshotStore::new(engine.catalog()).list()?)
        }

        Command::Snapshot { id } => {
            let engine = registry.query_engine(repo)?;
            print_json(&SnapshotStore::new(engine.catalog()).get(id)?)
        }

        Command::SnapshotEdges { id } => {
            let engine = registry.query_engine(repo)?;
            print_json(&SnapshotStore::new(engine.catalog()).edges(id)?)
        }

        Command::UpdateSnapshot { id, name, description, tags } => {
            let engine = registry.query_engine(repo)?;
            let store = SnapshotStore::new(engine.catalog());
            store.update_meta(id, name.as_deref(), description.as_deref(), tags.as_deref())?;
            print_json(&store.get(id)?)
        }

        Command::DeleteSnapshot { id } => {
            let engine = registry.query_engine(repo)?;
            SnapshotStore::new(engine.catalog()).delete(id)?;
            print_json(&serde_json::json!({ "deleted": id }))
        }

        Command::Compare { a, b } => {
            let engine = registry.query_engine(repo)?;
            print_json(&SnapshotStore::new(engine.catalog()).compare(a, b)?)
        }
    }
}

fn resolve(engine: &cochange::query::QueryEngine, path: &str) -> Result<cochange::core::FileId, Error> {
    engine
        .catalog()
        .file_id_for_path(path)?
        .ok_or_else(|| Error::not_found(format!("no file matches path '{}'", path)))
}

/// Parse repeated `key=value` flags into a JSON parameter bag.
///
/// Values parse as JSON scalars first, falling back to plain strings, so
/// `--param resolution=1.5` and `--param linkage=ward` both work.
fn parse_param_bag(params: &[String]) -> Result<serde_json::Map<String, serde_json::Value>, Error> {
    let mut bag = serde_json::Map::new();

    for param in params {
        let Some((key, value)) = param.split_once('=') else {
            return Err(Error::validation(format!(
                "parameters must look like key=value, got '{}'",
                param
            )));
        };

        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        bag.insert(key.to_string(), value);
    }

    Ok(bag)
}

fn algorithm_catalog() -> serde_json::Value {
    serde_json::json!([
        {
            "name": "louvain",
            "parameters": ["resolution", "min_weight", "random_state"],
        },
        {
            "name": "hierarchical",
            "parameters": ["n_clusters", "distance_threshold", "linkage", "min_weight"],
            "requires": "one of n_clusters or distance_threshold",
        },
        {
            "name": "dbscan",
            "parameters": ["eps", "min_samples", "min_weight"],
        },
        {
            "name": "label_propagation",
            "parameters": ["max_iterations", "min_weight"],
        },
        {
            "name": "connected_components",
            "parameters": ["min_weight"],
        },
    ])
}

#[derive(Serialize)]
struct RenderedCluster {
    id: i64,
    size: usize,
    files: Vec<String>,
}

#[derive(Serialize)]
struct RenderedClustering {
    algorithm: String,
    params: serde_json::Value,
    modularity: Option<f64>,
    clusters: Vec<RenderedCluster>,
}

fn render_clusters(view: &GraphView, result: &cluster::ClusterResult) -> RenderedClustering {
    let path_of: std::collections::HashMap<_, _> =
        view.nodes.iter().copied().zip(view.paths.iter().cloned()).collect();

    RenderedClustering {
        algorithm: result.algorithm.to_string(),
        params: result.params.clone(),
        modularity: result.modularity,
        clusters: result
            .clusters
            .iter()
            .map(|c| RenderedCluster {
                id: c.id,
                size: c.files.len(),
                files: c
                    .files
                    .iter()
                    .map(|f| path_of.get(f).cloned().unwrap_or_else(|| f.to_string()))
                    .collect(),
            })
            .collect(),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Error> {
    let text = serde_json::to_string_pretty(value).map_err(|e| Error::internal(e.to_string()))?;
    println!("{}", text);
    Ok(())
}
