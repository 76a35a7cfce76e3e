use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dstore::definition::DatasetDefinition;
use dstore::hash::checksum_fileset;
use dstore::storage::remote::CatalogBackend;
use dstore::storage::{
    DataStore, LocalStore, Provenance, RemoteConfig, RemoteStore, StorageConfig, StoreKind,
};
use dstore::{DataRow, DataTree, Datatype, FieldValue, FileSet, Space, TreeOptions};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "dstore")]
#[command(about = "Hierarchical dataset store", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a catalog server directory with one account
    InitServer {
        /// Server directory
        server: PathBuf,

        #[arg(long, env = "DSTORE_USER")]
        user: String,

        #[arg(long, env = "DSTORE_PASSWORD")]
        password: String,
    },

    /// Write the store configuration file
    Config(ConfigArgs),

    /// Create a dataset holding exactly the given leaves
    CreateTree {
        #[command(flatten)]
        dataset: DatasetArgs,

        /// Leaf as `/`-separated hierarchy IDs (repeatable)
        #[arg(long = "leaf")]
        leaves: Vec<String>,
    },

    /// List the rows of a dataset at a frequency
    Tree {
        #[command(flatten)]
        dataset: DatasetArgs,

        /// Row frequency (defaults to the leaf frequency)
        #[arg(long)]
        frequency: Option<String>,
    },

    /// List the entries stored at a row
    Ls {
        #[command(flatten)]
        dataset: DatasetArgs,

        #[command(flatten)]
        row: RowArgs,
    },

    /// Store files in a file-set entry
    Put {
        #[command(flatten)]
        dataset: DatasetArgs,

        #[command(flatten)]
        row: RowArgs,

        /// Entry path (`name`, `name@`, `name@analysis`)
        path: String,

        /// Files and directories making up the file-set
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[arg(long, default_value = "file-set")]
        datatype: Datatype,
    },

    /// Print the local paths of a file-set entry
    Get {
        #[command(flatten)]
        dataset: DatasetArgs,

        #[command(flatten)]
        row: RowArgs,

        path: String,

        #[arg(long, default_value = "file-set")]
        datatype: Datatype,
    },

    /// Store a field value (JSON, or plain text)
    SetField {
        #[command(flatten)]
        dataset: DatasetArgs,

        #[command(flatten)]
        row: RowArgs,

        path: String,

        value: String,

        #[arg(long, default_value = "text")]
        datatype: Datatype,
    },

    /// Print a field value
    GetField {
        #[command(flatten)]
        dataset: DatasetArgs,

        #[command(flatten)]
        row: RowArgs,

        path: String,

        #[arg(long, default_value = "text")]
        datatype: Datatype,
    },

    /// Read or write entry provenance
    Provenance {
        #[command(subcommand)]
        action: ProvenanceAction,
    },

    /// Save or load dataset definitions
    Define {
        #[command(subcommand)]
        action: DefineAction,
    },

    /// Print the checksums of a file-set entry
    Checksums {
        #[command(flatten)]
        dataset: DatasetArgs,

        #[command(flatten)]
        row: RowArgs,

        path: String,
    },
}

#[derive(Subcommand)]
enum ProvenanceAction {
    Get {
        #[command(flatten)]
        dataset: DatasetArgs,

        #[command(flatten)]
        row: RowArgs,

        path: String,
    },

    Put {
        #[command(flatten)]
        dataset: DatasetArgs,

        #[command(flatten)]
        row: RowArgs,

        path: String,

        /// JSON document holding the provenance record
        document: PathBuf,
    },
}

#[derive(Subcommand)]
enum DefineAction {
    /// Save the dataset's shape, plus any extra keys from a JSON file
    Save {
        #[command(flatten)]
        dataset: DatasetArgs,

        #[arg(long, default_value = "default")]
        name: String,

        /// JSON definition to merge over the generated one
        #[arg(long)]
        file: Option<PathBuf>,
    },

    Load {
        /// Dataset ID
        dataset: String,

        #[arg(long, default_value = "default")]
        name: String,
    },
}

#[derive(Args)]
struct ConfigArgs {
    /// Root directory of local datasets
    #[arg(long)]
    root: Option<PathBuf>,

    /// Catalog server directory; selects the remote store
    #[arg(long)]
    server: Option<PathBuf>,

    /// Cache of downloaded file-sets (defaults to `<root>/.remote-cache`)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    #[arg(long, env = "DSTORE_USER")]
    user: Option<String>,

    #[arg(long, env = "DSTORE_PASSWORD")]
    password: Option<String>,
}

impl ConfigArgs {
    fn apply(self, mut config: StorageConfig) -> Result<StorageConfig> {
        if let Some(root) = self.root {
            config.root = root;
        }
        if let Some(server) = self.server {
            let cache_dir = self
                .cache_dir
                .unwrap_or_else(|| config.root.join(".remote-cache"));
            let user = self.user.context("--user is required with --server")?;
            let password = self.password.context("--password is required with --server")?;
            config.remote = Some(RemoteConfig::new(server, cache_dir, user, password));
            config.store_type = StoreKind::Remote;
        }
        Ok(config)
    }
}

#[derive(Args)]
struct DatasetArgs {
    /// Dataset ID
    dataset: String,

    /// Hierarchy levels, outermost first
    #[arg(long, value_delimiter = ',', required = true)]
    hierarchy: Vec<String>,

    /// Built-in space (`test` or `clinical`)
    #[arg(long, default_value = "test")]
    space: String,

    /// ID composition as `level=pattern` (repeatable)
    #[arg(long = "compose", value_parser = parse_key_value)]
    compose: Vec<(String, String)>,
}

impl DatasetArgs {
    fn space(&self) -> Result<Space> {
        Ok(Space::builtin(&self.space)?)
    }

    fn options(&self) -> TreeOptions {
        TreeOptions {
            id_composition: self.compose.iter().cloned().collect(),
            ..TreeOptions::default()
        }
    }

    fn tree(&self) -> Result<DataTree> {
        Ok(DataTree::new(
            &self.dataset,
            self.space()?,
            self.hierarchy.clone(),
            &self.options().id_composition,
        )?)
    }
}

#[derive(Args)]
struct RowArgs {
    /// Row IDs as `/`-separated values (hierarchy IDs for leaf rows)
    #[arg(long, default_value = "")]
    row: String,

    /// Row frequency (defaults to the leaf frequency)
    #[arg(long)]
    frequency: Option<String>,
}

impl RowArgs {
    fn ids(&self) -> Vec<String> {
        self.row
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected `level=pattern`, got '{s}'"))
}

async fn open_store() -> Result<Box<dyn DataStore>> {
    let config = StorageConfig::load().await?;
    let store: Box<dyn DataStore> = match config.store_type {
        StoreKind::Local => Box::new(LocalStore::new(&config)),
        StoreKind::Remote => {
            let remote = config
                .remote
                .as_ref()
                .context("remote store selected without [remote] settings")?;
            Box::new(RemoteStore::from_config(remote))
        }
    };
    tracing::debug!("Using {} store", store.name());
    Ok(store)
}

async fn resolve_row(store: &dyn DataStore, dataset: &DatasetArgs, row: &RowArgs) -> Result<DataRow> {
    let mut tree = dataset.tree()?;
    store
        .populate_tree(&mut tree)
        .await
        .with_context(|| format!("Failed to scan dataset {}", dataset.dataset))?;

    let ids = row.ids();
    let found = match &row.frequency {
        None => tree.leaf_row(&ids),
        Some(frequency) => tree.row(tree.space().parse_frequency(frequency)?, &ids),
    };
    let mut found = found.with_context(|| format!("No row '{}' in {}", row.row, dataset.dataset))?;
    store.populate_row(&mut found).await?;
    Ok(found)
}

fn parse_field(value: String) -> FieldValue {
    serde_json::from_str(&value).unwrap_or(FieldValue::Text(value))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::InitServer {
            server,
            user,
            password,
        } => {
            CatalogBackend::initialize(&server, &user, &password)
                .await
                .with_context(|| format!("Failed to initialize server at {}", server.display()))?;
            println!("Initialized catalog server at {}", server.display());
            Ok(())
        }
        Commands::Config(args) => {
            let config = args.apply(StorageConfig::load().await?)?;
            let path = config.save().await?;
            println!("Wrote {}", path.display());
            Ok(())
        }
        Commands::CreateTree { dataset, leaves } => {
            let store = open_store().await?;
            let leaves: Vec<Vec<String>> = leaves
                .iter()
                .map(|leaf| leaf.split('/').map(str::to_string).collect())
                .collect();
            store
                .create_data_tree(
                    &dataset.dataset,
                    &leaves,
                    &dataset.hierarchy,
                    &dataset.space()?,
                    &dataset.options(),
                )
                .await
                .with_context(|| format!("Failed to create dataset {}", dataset.dataset))?;
            println!("Created {} with {} leaves", dataset.dataset, leaves.len());
            Ok(())
        }
        Commands::Tree { dataset, frequency } => {
            let store = open_store().await?;
            let mut tree = dataset.tree()?;
            store.populate_tree(&mut tree).await?;
            let rows = match frequency {
                Some(frequency) => tree.rows_named(&frequency)?,
                None => tree.rows(tree.space().leaf()),
            };
            for row in rows {
                match &row.hierarchy_ids {
                    Some(ids) => println!("{}  ({})", row.label(), ids.join("/")),
                    None => println!("{}", row.label()),
                }
            }
            Ok(())
        }
        Commands::Ls { dataset, row } => {
            let store = open_store().await?;
            let row = resolve_row(store.as_ref(), &dataset, &row).await?;
            for entry in row.entries() {
                println!("{}\t{}\t{}", entry.path, entry.datatype, entry.uri);
            }
            Ok(())
        }
        Commands::Put {
            dataset,
            row,
            path,
            files,
            datatype,
        } => {
            let store = open_store().await?;
            let row = resolve_row(store.as_ref(), &dataset, &row).await?;
            let entry = store.create_entry(&path, datatype, &row).await?;
            let stored = store
                .put_fileset(&FileSet::new(files), &entry)
                .await
                .with_context(|| format!("Failed to store {}", path))?;
            tracing::info!("Stored {} at {}", path, entry.uri);
            for fspath in stored.fspaths() {
                println!("{}", fspath.display());
            }
            Ok(())
        }
        Commands::Get {
            dataset,
            row,
            path,
            datatype,
        } => {
            let store = open_store().await?;
            let row = resolve_row(store.as_ref(), &dataset, &row).await?;
            let entry = row.entry(&path)?.with_context(|| format!("No entry {}", path))?;
            let fileset = store.get_fileset(entry, datatype).await?;
            for fspath in fileset.fspaths() {
                println!("{}", fspath.display());
            }
            Ok(())
        }
        Commands::SetField {
            dataset,
            row,
            path,
            value,
            datatype,
        } => {
            let store = open_store().await?;
            let row = resolve_row(store.as_ref(), &dataset, &row).await?;
            let entry = store.create_entry(&path, datatype, &row).await?;
            store.put_field(&parse_field(value), &entry).await?;
            Ok(())
        }
        Commands::GetField {
            dataset,
            row,
            path,
            datatype,
        } => {
            let store = open_store().await?;
            let row = resolve_row(store.as_ref(), &dataset, &row).await?;
            let entry = row.entry(&path)?.with_context(|| format!("No entry {}", path))?;
            println!("{}", store.get_field(entry, datatype).await?);
            Ok(())
        }
        Commands::Provenance { action } => {
            let store = open_store().await?;
            match action {
                ProvenanceAction::Get { dataset, row, path } => {
                    let row = resolve_row(store.as_ref(), &dataset, &row).await?;
                    let entry = row.entry(&path)?.with_context(|| format!("No entry {}", path))?;
                    match store.get_provenance(entry).await? {
                        Some(provenance) => println!("{}", serde_json::to_string_pretty(&provenance)?),
                        None => println!("No provenance recorded for {}", path),
                    }
                }
                ProvenanceAction::Put {
                    dataset,
                    row,
                    path,
                    document,
                } => {
                    let row = resolve_row(store.as_ref(), &dataset, &row).await?;
                    let entry = row.entry(&path)?.with_context(|| format!("No entry {}", path))?;
                    let content = tokio::fs::read_to_string(&document)
                        .await
                        .with_context(|| format!("Failed to read {}", document.display()))?;
                    let provenance: Provenance = serde_json::from_str(&content)
                        .with_context(|| format!("{} is not a JSON object", document.display()))?;
                    store.put_provenance(&provenance, entry).await?;
                }
            }
            Ok(())
        }
        Commands::Define { action } => {
            let store = open_store().await?;
            match action {
                DefineAction::Save {
                    dataset,
                    name,
                    file,
                } => {
                    let mut definition = DatasetDefinition::new(dataset.space()?, dataset.hierarchy.clone());
                    definition.id_composition = dataset.compose.iter().cloned().collect::<BTreeMap<_, _>>();
                    let mut document = definition.to_document()?;
                    if let Some(file) = file {
                        let content = tokio::fs::read_to_string(&file)
                            .await
                            .with_context(|| format!("Failed to read {}", file.display()))?;
                        let extra: serde_json::Map<String, serde_json::Value> =
                            serde_json::from_str(&content)
                                .with_context(|| format!("{} is not a JSON object", file.display()))?;
                        if let Some(object) = document.as_object_mut() {
                            object.extend(extra);
                        }
                    }
                    // Reject documents this crate could not load again
                    DatasetDefinition::from_document(&dataset.dataset, &name, document.clone())?;
                    store
                        .save_dataset_definition(&dataset.dataset, &document, &name)
                        .await?;
                    println!("Saved definition '{}' of {}", name, dataset.dataset);
                }
                DefineAction::Load { dataset, name } => {
                    let document = store.load_dataset_definition(&dataset, &name).await?;
                    println!("{}", serde_json::to_string_pretty(&document)?);
                }
            }
            Ok(())
        }
        Commands::Checksums { dataset, row, path } => {
            let store = open_store().await?;
            let row = resolve_row(store.as_ref(), &dataset, &row).await?;
            let entry = row.entry(&path)?.with_context(|| format!("No entry {}", path))?;
            let fileset = store.get_fileset(entry, Datatype::FileSet).await?;
            for (file, digest) in checksum_fileset(&fileset).await? {
                println!("{}  {}", digest, file);
            }
            Ok(())
        }
    }
}
