//! Command-line entry point for the OSM way import.

use std::io;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::info;
use structured_logger::json::new_writer;
use structured_logger::Builder;

use osm_geo_import::cache::CoordinateCache;
use osm_geo_import::config::{load_config, ImportConfig};
use osm_geo_import::errors::Result;
use osm_geo_import::etl::node_cache::{verify_cache, NodeCacheEtl};
use osm_geo_import::etl::parse_osm::{count_elements, open_osm_file};
use osm_geo_import::etl::Etl;
use osm_geo_import::pipeline::ImportPipeline;
use osm_geo_import::remote::{OfflineAuthority, OsmApiClient, RemoteAuthority};
use osm_geo_import::sink::JsonLinesSink;

#[derive(Parser)]
#[command(name = "osm-geo-import")]
#[command(about = "Import OSM ways as polylines and polygons through a sharded node cache", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(long, short, default_value = "config/import.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy, Debug, PartialEq, Eq)]
enum Command {
    /// Stream the dump, resolve every way and write records (default)
    Import,

    /// Populate the node cache from the dump, stopping at the first way
    Cache,

    /// Check that every node of the dump resolves in the cache
    Verify,

    /// Count nodes, ways and relations in the dump
    Count,

    /// Delete every cache shard, leaving a cold cache
    ClearCache,
}

fn setup_logging(level: &str) {
    Builder::with_level(level)
        .with_target_writer("*", new_writer(io::stdout()))
        .init();
}

fn remote_authority(config: &ImportConfig) -> Result<Box<dyn RemoteAuthority>> {
    if config.remote.enabled {
        Ok(Box::new(OsmApiClient::from_config(&config.remote)?))
    } else {
        info!("Remote lookups disabled");
        Ok(Box::new(OfflineAuthority))
    }
}

fn import(config: &ImportConfig) -> Result<()> {
    let cache = CoordinateCache::open(&config.cache_dir, config.shard_count)?;
    let authority = remote_authority(config)?;
    let mut sink = JsonLinesSink::open(&config.output_dir)?;
    let elements = open_osm_file(&config.data_path)?;

    let mut pipeline = ImportPipeline::new(config, &cache, &*authority, &mut sink);
    let stats = pipeline.run(tqdm::tqdm(elements))?;
    eprintln!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn populate_cache(config: &ImportConfig) -> Result<()> {
    let cache = CoordinateCache::open(&config.cache_dir, config.shard_count)?;
    let elements = open_osm_file(&config.data_path)?;
    let mut etl = NodeCacheEtl::new(tqdm::tqdm(elements), &cache);
    etl.process()?;
    eprintln!("{}", serde_json::to_string_pretty(&etl.report())?);
    Ok(())
}

fn verify(config: &ImportConfig) -> Result<()> {
    let cache = CoordinateCache::open(&config.cache_dir, config.shard_count)?;
    let elements = open_osm_file(&config.data_path)?;
    let report = verify_cache(tqdm::tqdm(elements), &cache)?;
    info!(checked = report.checked, missing = report.missing, mismatched = report.mismatched; "Cache verified");
    eprintln!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn count(config: &ImportConfig) -> Result<()> {
    let counts = count_elements(tqdm::tqdm(open_osm_file(&config.data_path)?))?;
    info!(nodes = counts.nodes, ways = counts.ways, relations = counts.relations; "Counted elements");
    eprintln!("nodes: {}, ways: {}, relations: {}", counts.nodes, counts.ways, counts.relations);
    Ok(())
}

fn clear_cache(config: &ImportConfig) -> Result<()> {
    let cache = CoordinateCache::open(&config.cache_dir, config.shard_count)?;
    cache.clear()?;
    let dir = config.cache_dir.display().to_string();
    info!(cache_dir = dir.as_str(); "Coordinate cache cleared");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config)?;
    setup_logging(&config.log_level);
    let config_path = cli.config.display().to_string();
    info!(config = config_path.as_str(); "Loaded configuration");

    match cli.command.unwrap_or(Command::Import) {
        Command::Import => import(&config),
        Command::Cache => populate_cache(&config),
        Command::Verify => verify(&config),
        Command::Count => count(&config),
        Command::ClearCache => clear_cache(&config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subcommand_defaults_to_import() {
        let cli = Cli::try_parse_from(["osm-geo-import"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("config/import.json"));
        assert_eq!(cli.command.unwrap_or(Command::Import), Command::Import);
    }

    #[test]
    fn config_flag_and_kebab_case_subcommand() {
        let cli = Cli::try_parse_from(["osm-geo-import", "--config", "london.json", "clear-cache"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("london.json"));
        assert_eq!(cli.command, Some(Command::ClearCache));
    }

    #[test]
    fn unknown_subcommand_is_rejected() {
        assert!(Cli::try_parse_from(["osm-geo-import", "render"]).is_err());
    }
}
