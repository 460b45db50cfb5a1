use clap::{Arg, Command};
use std::error::Error;
use std::path::Path;
use std::sync::Arc;

use meshsync::config::Config;
use meshsync::fileset::db::IndexDb;
use meshsync::logging;
use meshsync::model::Model;
use meshsync::types::NodeId;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
	logging::init_tracing();

	let matches = Command::new("meshsync")
		.version(env!("CARGO_PKG_VERSION"))
		.about("Peer-to-peer file replication")
		.subcommand_required(true)
		.arg(
			Arg::new("config")
				.short('c')
				.long("config")
				.value_name("FILE")
				.default_value("meshsync.toml")
				.help("Configuration file"),
		)
		.subcommand(Command::new("scan").about("Scan all repositories and print index sizes"))
		.subcommand(
			Command::new("dump")
				.about("Dump the local index of a repository")
				.arg(Arg::new("repo").required(true)),
		)
		.get_matches();

	let config_path = matches.get_one::<String>("config").expect("has a default");
	let config = Config::load(Path::new(config_path))?;
	let model = build_model(&config).await?;

	if matches.subcommand_matches("scan").is_some() {
		model.clean_repos().await;
		model.scan_repos().await;
		for repo in &config.repositories {
			let local = model.local_size(&repo.id).await;
			let global = model.global_size(&repo.id).await;
			let need = model.need_size(&repo.id).await;
			println!(
				"{}: local {} files, {} deleted, {} B; global {} files, {} B; need {} entries, {} B",
				repo.id,
				local.files,
				local.deleted,
				local.bytes,
				global.files,
				global.bytes,
				need.files + need.deleted,
				need.bytes,
			);
		}
		model.save_indexes().await;
	} else if let Some(sub) = matches.subcommand_matches("dump") {
		let repo = sub.get_one::<String>("repo").expect("required");
		let set = model
			.file_set(repo)
			.await
			.ok_or_else(|| format!("unknown repository {}", repo))?;
		set.with_have(NodeId::LOCAL, |f| {
			println!("{}\tv{}\t{:o}\t{} B", f.name, f.version, f.flags, f.size);
			true
		});
	}

	Ok(())
}

async fn build_model(config: &Config) -> Result<Arc<Model>, Box<dyn Error + Send + Sync>> {
	std::fs::create_dir_all(&config.index_dir)?;

	let mut model =
		Model::new(config.node_id, &config.client_name, &config.client_version, &config.index_dir);
	let db = IndexDb::open(&config.index_dir.join("index.db"))?;
	model.set_index_db(Arc::new(db));
	model.set_max_change_kbps(config.max_change_kbps);

	let model = Arc::new(model);
	for repo in config.repositories.clone() {
		model.add_repo(repo).await;
	}
	model.load_indexes().await;
	Ok(model)
}

// vim: ts=4
