//! Command line front end for the mboxdex pipeline.
//!
//! ```bash
//! # Build (or verify) the offset index and print its profile
//! mboxdex index archive.mbox
//!
//! # Show the largest conversation threads
//! mboxdex groups archive.mbox --limit 20
//!
//! # Split every message into its own file plus a metadata.jsonl
//! mboxdex run archive.mbox out/ --workers 8 --strategy locality
//! ```

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use clap::{Args, Parser, Subcommand};
use log::error;
use mboxdex::core::config::Config;
use mboxdex::core::engine::Engine;
use mboxdex::core::error::Result;
use mboxdex::index::extractor::MboxHeaderExtractor;
use mboxdex::index::group_index::GroupIndexBuilder;
use mboxdex::index::offset_index::OffsetIndexBuilder;
use mboxdex::parallel::distributor::PartitionStrategy;
use mboxdex::parallel::transform::RawRecordTransform;
use mboxdex::storage::layout::StorageLayout;
use mboxdex::writer::metadata_store::JsonlMetadataStore;

#[derive(Parser)]
#[command(name = "mboxdex")]
#[command(about = "Indexed parallel processing of mbox archives")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the offset index if missing or stale and print its statistics
    Index {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Build the group index and list the largest groups
    Groups {
        #[command(flatten)]
        common: CommonArgs,

        /// Number of groups to list
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Run the full pipeline, writing one artifact per record
    Run {
        #[command(flatten)]
        common: CommonArgs,

        /// Output directory for artifacts and metadata.jsonl
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Worker threads (default: number of CPUs)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Partition strategy: balanced or locality
        #[arg(short, long)]
        strategy: Option<PartitionStrategy>,

        /// Flush after this many buffered results
        #[arg(long)]
        flush_items: Option<usize>,

        /// Flush after this many buffered bytes
        #[arg(long)]
        flush_bytes: Option<usize>,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// Path to the mbox archive
    archive: Option<PathBuf>,

    /// JSON config file; command line flags override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Rebuild indexes even if they look current
    #[arg(long)]
    force_rebuild: bool,
}

impl CommonArgs {
    fn load(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_json_file(path)?,
            None => Config::default(),
        };
        if let Some(archive) = &self.archive {
            config.archive_path = archive.clone();
        }
        config.force_rebuild |= self.force_rebuild;
        Ok(config)
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(e) = execute(cli.command) {
        error!("{}", e);
        process::exit(1);
    }
}

fn execute(command: Commands) -> Result<()> {
    match command {
        Commands::Index { common } => {
            let config = common.load()?;
            config.validate()?;
            StorageLayout::new(&config)?;
            let builder = OffsetIndexBuilder::from_config(&config, Arc::new(MboxHeaderExtractor::new()));
            let index = builder.open_or_build(config.force_rebuild, config.show_progress)?;
            let summary = index.statistics();

            println!("Index:        {}", index.index_path().display());
            println!("Archive:      {}", index.archive_path().display());
            println!("Records:      {}", summary.record_count);
            println!("Record bytes: {}", summary.total_record_bytes);
            println!(
                "Record size:  avg {:.0}, min {}, max {}",
                summary.avg_record_bytes, summary.min_record_bytes, summary.max_record_bytes
            );
            println!("Index bytes:  {}", summary.index_file_bytes);
            println!("Built at:     {}", index.metadata().built_at);
            let duplicates = index.duplicate_candidates();
            if !duplicates.is_empty() {
                println!("Possible duplicates: {} sets", duplicates.len());
            }
        }
        Commands::Groups { common, limit } => {
            let config = common.load()?;
            config.validate()?;
            let layout = StorageLayout::new(&config)?;
            let index = OffsetIndexBuilder::from_config(&config, Arc::new(MboxHeaderExtractor::new()))
                .open_or_build(config.force_rebuild, config.show_progress)?;
            let groups = GroupIndexBuilder::new(&index).load_or_build(&layout.group_index_path())?;

            let stats = groups.group_stats();
            println!(
                "Groups: {} ({} records, avg {:.1}, min {}, max {})",
                stats.count, stats.total_records, stats.avg_size, stats.min_size, stats.max_size
            );
            for (key, size) in groups.largest_groups(limit) {
                println!("  {:>6}  {}", size, key);
            }

            let secondary = groups.secondary_stats();
            println!("Secondary keys: {} ({} records)", secondary.count, secondary.total_records);
            for (key, size) in groups.largest_secondary(limit) {
                println!("  {:>6}  {}", size, key);
            }
        }
        Commands::Run {
            common,
            output,
            workers,
            strategy,
            flush_items,
            flush_bytes,
        } => {
            let mut config = common.load()?;
            if let Some(output) = output {
                config.output_dir = output;
            }
            if let Some(workers) = workers {
                config.workers = workers;
            }
            if let Some(strategy) = strategy {
                config.partition_strategy = strategy;
            }
            if let Some(items) = flush_items {
                config.flush_max_items = items;
            }
            if let Some(bytes) = flush_bytes {
                config.flush_max_bytes = bytes;
            }

            let engine = Engine::open(config, Arc::new(MboxHeaderExtractor::new()))?;
            let store = JsonlMetadataStore::open(engine.storage().metadata_path())?;
            let summary = engine.run(&RawRecordTransform, Box::new(store))?;

            println!("Processed: {}", summary.processed);
            println!("Errors:    {}", summary.errors);
            println!("Skipped:   {} batches ({} records)", summary.skipped_batches, summary.skipped_records);
            println!("Retried:   {} batches", summary.retried_batches);
            println!(
                "Written:   {} artifacts, {} rows in {} flushes",
                summary.writer.artifacts_written, summary.writer.rows_written, summary.writer.flushes
            );
            println!("Elapsed:   {:.1}s ({:.0} records/sec)", summary.elapsed.as_secs_f64(), summary.rate);
            summary.into_result()?;
        }
    }
    Ok(())
}
