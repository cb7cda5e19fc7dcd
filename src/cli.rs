use anyhow::{Context, Result, anyhow};
use chrono::NaiveDate;
use clap::{ArgAction, Args, Parser, Subcommand};
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;

#[cfg(feature = "server")]
use icsflow::serve::{ServeArgs, run_serve};
use icsflow::upload::CalendarFile;
use icsflow::{
    BuildMode, FileStore, NodeKind, Point, SelectionPolicy, UploadClient, Workspace,
    WorkspaceConfig, WorkspaceSnapshot,
};

#[derive(Debug, Parser)]
#[command(
    name = "icsflow",
    about = "Turn uploaded calendars into a laid-out, undoable event graph."
)]
struct Cli {
    /// Directory holding the persisted workspace (defaults to ICSFLOW_DATA_DIR).
    #[arg(long = "data-dir", global = true)]
    data_dir: Option<PathBuf>,

    /// Base URL of the .ics parse backend (defaults to ICSFLOW_BACKEND_URL).
    #[arg(long = "backend-url", global = true)]
    backend_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build the graph from a parse-result JSON file. Use '-' to read from stdin.
    Build {
        #[arg(short = 'i', long = "input", default_value = "-")]
        input: String,

        /// Merge with the previously stored upload instead of replacing it.
        #[arg(long, action = ArgAction::SetTrue)]
        append: bool,

        #[command(flatten)]
        mode: ModeFlags,
    },
    /// Send .ics files to the parse backend and build the graph from its answer.
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[arg(long, action = ArgAction::SetTrue)]
        append: bool,

        #[command(flatten)]
        mode: ModeFlags,
    },
    /// Append a node below the last one.
    Add {
        label: String,

        /// Draw an edge from this node to the new one.
        #[arg(long)]
        parent: Option<String>,

        /// Create a root node instead of an event node.
        #[arg(long, action = ArgAction::SetTrue)]
        root: bool,
    },
    /// Connect two nodes.
    Connect { source: String, target: String },
    /// Remove an edge by its id.
    Disconnect { edge: String },
    /// Move a node to a new position.
    #[command(name = "move", allow_negative_numbers = true)]
    MoveNode { node: String, x: f32, y: f32 },
    /// Change a node's label.
    Rename { node: String, label: String },
    /// Delete a node and its edges.
    Remove { node: String },
    /// Recompute which events are highlighted.
    Select {
        /// Reference day as YYYY-MM-DD (defaults to today).
        #[arg(long)]
        date: Option<NaiveDate>,

        /// 'weekday' or 'date'.
        #[arg(long)]
        policy: Option<SelectionPolicy>,
    },
    /// Go back to the state before the last change.
    Undo,
    /// Discard the saved layout and rebuild from the stored upload.
    Reset {
        #[command(flatten)]
        mode: ModeFlags,
    },
    /// Print the current graph.
    Show {
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,

        /// Only show the chain of this day (YYYY-MM-DD).
        #[arg(long)]
        day: Option<NaiveDate>,
    },
    /// List the days that have events.
    Dates,
}

/// Without either flag the stored build mode is kept.
#[derive(Debug, Args)]
struct ModeFlags {
    /// One chain per day under a schedule root.
    #[arg(long, action = ArgAction::SetTrue, conflicts_with = "chain")]
    grouped: bool,

    /// One chain over every event.
    #[arg(long, action = ArgAction::SetTrue)]
    chain: bool,
}

impl ModeFlags {
    fn mode(&self) -> Option<BuildMode> {
        match (self.grouped, self.chain) {
            (true, _) => Some(BuildMode::Grouped),
            (_, true) => Some(BuildMode::Chain),
            _ => None,
        }
    }
}

pub async fn dispatch() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(|s| s.as_str()) {
        Some("serve") => {
            #[cfg(feature = "server")]
            {
                let serve_args = ServeArgs::parse_from(
                    std::iter::once(args[0].clone()).chain(args.iter().skip(2).cloned()),
                );
                run_serve(serve_args, WorkspaceConfig::default()).await
            }
            #[cfg(not(feature = "server"))]
            {
                Err(anyhow!(
                    "'serve' command requires the 'server' feature to be enabled"
                ))
            }
        }
        _ => run(Cli::parse_from(args)).await,
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = WorkspaceConfig::default();
    if let Some(dir) = cli.data_dir {
        config = config.with_data_dir(dir);
    }
    if let Some(url) = cli.backend_url {
        config.backend_url = url.trim_end_matches('/').to_string();
    }

    let store = FileStore::open(&config.data_dir)?;
    let mut workspace = Workspace::open(store, config.clone()).with_context(|| {
        format!("failed to open workspace in '{}'", config.data_dir.display())
    })?;

    match cli.command {
        Command::Build {
            input,
            append,
            mode,
        } => {
            let raw = read_input(&input)?;
            workspace = apply_mode(workspace, &mode);
            let snapshot = workspace.ingest_raw(&raw, append)?;
            print_summary(snapshot);
        }
        Command::Upload {
            files,
            append,
            mode,
        } => {
            let mut calendars = Vec::with_capacity(files.len());
            for path in &files {
                calendars.push(CalendarFile::read(path).await?);
            }
            let client = UploadClient::from_config(&config)?;
            let payload = client.upload(&calendars).await?;
            if let Some(message) = payload.message() {
                println!("{message}");
            }
            workspace = apply_mode(workspace, &mode);
            let snapshot = if append {
                workspace.append_upload(payload)?
            } else {
                workspace.ingest_upload(payload)?
            };
            print_summary(snapshot);
        }
        Command::Add {
            label,
            parent,
            root,
        } => {
            let kind = if root { NodeKind::Root } else { NodeKind::Event };
            let id = workspace.add_node(&label, kind, parent.as_deref())?;
            println!("{id}");
        }
        Command::Connect { source, target } => {
            if workspace.connect(&source, &target)? {
                println!("Connected {source} -> {target}");
            } else {
                println!("{source} -> {target} already exists");
            }
        }
        Command::Disconnect { edge } => {
            let removed = workspace.disconnect(&edge)?;
            println!("Removed {} -> {}", removed.source_id, removed.target_id);
        }
        Command::MoveNode { node, x, y } => {
            workspace.move_node(&node, Point::new(x, y))?;
            println!("Moved {node} to ({x}, {y})");
        }
        Command::Rename { node, label } => {
            workspace.rename_node(&node, &label)?;
            println!("Renamed {node}");
        }
        Command::Remove { node } => {
            workspace.remove_node(&node)?;
            println!("Removed {node}");
        }
        Command::Select { date, policy } => {
            if let Some(policy) = policy {
                workspace.set_policy(policy)?;
            }
            let reference = date.unwrap_or_else(|| today(&config));
            workspace.set_reference_date(reference)?;
            let selected = workspace
                .snapshot()
                .nodes
                .iter()
                .filter(|node| node.selected)
                .count();
            println!(
                "{selected} event(s) match {reference} by {}",
                workspace.policy()
            );
        }
        Command::Undo => {
            if workspace.undo()? {
                println!("Restored previous state");
                print_summary(workspace.snapshot());
            } else {
                println!("Nothing to undo");
            }
        }
        Command::Reset { mode } => {
            workspace = apply_mode(workspace, &mode);
            let snapshot = workspace.reset()?;
            print_summary(snapshot);
        }
        Command::Show { json, day } => {
            let day_view;
            let snapshot = match day {
                Some(date) => {
                    day_view = workspace.day_view(date)?;
                    &day_view
                }
                None => workspace.snapshot(),
            };
            if json {
                println!("{}", serde_json::to_string_pretty(snapshot)?);
            } else {
                print_graph(snapshot);
            }
        }
        Command::Dates => {
            let dates = workspace.available_dates()?;
            if dates.is_empty() {
                println!("No events uploaded");
            }
            for date in dates {
                println!("{date}");
            }
        }
    }

    Ok(())
}

fn apply_mode(workspace: Workspace<FileStore>, flags: &ModeFlags) -> Workspace<FileStore> {
    match flags.mode() {
        Some(mode) => workspace.with_mode(mode),
        None => workspace,
    }
}

fn today(config: &WorkspaceConfig) -> NaiveDate {
    chrono::Utc::now().with_timezone(&config.zone).date_naive()
}

fn read_input(input: &str) -> Result<String> {
    if input == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        if buffer.trim().is_empty() {
            return Err(anyhow!("no parse result supplied on stdin"));
        }
        return Ok(buffer);
    }

    let path = PathBuf::from(input);
    if !path.exists() {
        return Err(anyhow!("input file '{input}' does not exist"));
    }
    fs::read_to_string(&path).with_context(|| format!("failed to read '{}'", path.display()))
}

fn print_summary(snapshot: &WorkspaceSnapshot) {
    println!(
        "Graph has {} node(s) and {} edge(s)",
        snapshot.nodes.len(),
        snapshot.edges.len()
    );
}

fn print_graph(snapshot: &WorkspaceSnapshot) {
    if snapshot.is_empty() {
        println!("Workspace is empty");
        return;
    }

    println!("nodes ({}):", snapshot.nodes.len());
    for node in &snapshot.nodes {
        let marker = if node.selected { " *" } else { "" };
        println!(
            "  {}  [{}] {}  @ ({:.0}, {:.0}){marker}",
            node.id,
            node.kind.as_str(),
            node.label,
            node.position.x,
            node.position.y
        );
    }
    println!("edges ({}):", snapshot.edges.len());
    for edge in &snapshot.edges {
        println!("  {}  {} -> {}", edge.id, edge.source_id, edge.target_id);
    }
}
