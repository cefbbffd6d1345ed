//! Orbit CLI - administration for the Orbit permission datastore.
//!
//! Inspects and edits groups and subjects in a SQLite-backed datastore and
//! answers permission checks the way a host would.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use orbit_datastore::permissions::FALLBACK_NODE;
use orbit_datastore::{
    telemetry, Datastore, DatastoreConfig, Group, GroupRecord, Permissible,
    PermissionAttachment, Subject,
};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

const DEFAULT_DATABASE: &str = "orbit.db";

/// Orbit - permission datastore administration
#[derive(Debug, Parser)]
#[command(name = "orbit")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file (ORBIT_* environment variables apply on top)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database file, overriding the configured one
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Multi-line log output with source locations
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the schema and the default group if missing
    Init,
    /// List all groups
    Groups,
    /// Inspect or edit a group
    Group {
        #[command(subcommand)]
        action: GroupAction,
    },
    /// Inspect or edit a subject
    Subject {
        #[command(subcommand)]
        action: SubjectAction,
    },
    /// Ask whether a group or subject holds a permission
    Check {
        #[command(subcommand)]
        target: CheckTarget,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Debug, Subcommand)]
enum GroupAction {
    /// Show a group with its resolved permissions
    Show { name: String },
    /// Create a group
    Create {
        name: String,

        /// Parent group (repeatable)
        #[arg(short, long = "parent")]
        parents: Vec<String>,

        /// Own permission node (repeatable)
        #[arg(short = 'n', long = "permission")]
        permissions: Vec<String>,

        /// Unique ordering weight
        #[arg(short, long)]
        sort_order: i32,

        /// Text shown instead of the name
        #[arg(long)]
        display_name: Option<String>,
    },
    /// Delete a group
    Delete { name: String },
    /// Add a permission node to a group
    Grant { name: String, node: String },
    /// Remove a permission node from a group
    Revoke { name: String, node: String },
    /// Add or remove a parent of a group
    Parent {
        name: String,
        parent: String,

        /// Remove the parent instead of adding it
        #[arg(long)]
        remove: bool,
    },
}

#[derive(Debug, Subcommand)]
enum SubjectAction {
    /// Show a subject and its combined permissions
    Show { id: Uuid },
    /// Move a subject to a group, creating the subject if needed
    Assign {
        id: Uuid,
        group: String,

        /// Display name to record for the subject
        #[arg(long)]
        name: Option<String>,
    },
    /// Record that a subject was seen just now
    Seen {
        id: Uuid,

        /// Display name the subject was seen under
        #[arg(long)]
        name: Option<String>,
    },
    /// Add an own permission node to a subject
    Grant { id: Uuid, node: String },
    /// Remove an own permission node from a subject
    Revoke { id: Uuid, node: String },
}

#[derive(Debug, Subcommand)]
enum CheckTarget {
    /// Check a group's effective set
    Group { name: String, permission: String },
    /// Check a subject, applying negated nodes
    Subject { id: Uuid, permission: String },
}

#[derive(Debug, Serialize)]
struct GroupView {
    #[serde(flatten)]
    record: GroupRecord,
    effective_permissions: Vec<String>,
    unresolved_parents: Vec<String>,
}

#[derive(Debug, Serialize)]
struct SubjectView {
    id: Uuid,
    name: Option<String>,
    group: String,
    last_seen: Option<DateTime<Utc>>,
    persisted: bool,
    own_permissions: Vec<String>,
    effective_permissions: Vec<PermissionAttachment>,
}

#[derive(Debug, Serialize)]
struct CheckView<'a> {
    target: &'a str,
    permission: &'a str,
    allowed: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let logging = if cli.verbose {
        telemetry::init_local()
    } else {
        telemetry::init()
    };
    logging.map_err(|e| anyhow!("Failed to initialize logging: {e}"))?;

    let config = load_config(&cli)?;
    if let Commands::Config = cli.command {
        return run_config(&config);
    }

    let datastore = Datastore::with_sqlite(config).context("Failed to start datastore")?;
    let result = run(&datastore, cli.command, cli.json);
    datastore.close();
    result
}

fn load_config(cli: &Cli) -> Result<DatastoreConfig> {
    let mut config =
        DatastoreConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    if let Some(database) = &cli.database {
        config.database.path = Some(database.clone());
    }
    if config.database.path.is_none() {
        config.database.path = Some(PathBuf::from(DEFAULT_DATABASE));
    }

    config.log_config();
    Ok(config)
}

fn run(datastore: &Datastore, command: Commands, json: bool) -> Result<()> {
    match command {
        Commands::Init => run_init(datastore),
        Commands::Groups => {
            open(datastore)?;
            run_groups(datastore, json)
        }
        Commands::Group { action } => {
            open(datastore)?;
            run_group(datastore, action, json)
        }
        Commands::Subject { action } => {
            open(datastore)?;
            run_subject(datastore, action, json)
        }
        Commands::Check { target } => {
            open(datastore)?;
            run_check(datastore, target, json)
        }
        Commands::Config => Ok(()),
    }
}

/// Connect and warm the group cache
fn open(datastore: &Datastore) -> Result<()> {
    datastore.connect().context("Failed to open database")?;
    if !datastore.fetch_and_cache_groups() {
        bail!("Failed to load groups");
    }
    Ok(())
}

fn run_config(config: &DatastoreConfig) -> Result<()> {
    print!("{}", config.to_toml()?);
    Ok(())
}

fn run_init(datastore: &Datastore) -> Result<()> {
    let default = datastore
        .bootstrap()
        .context("Failed to initialize datastore")?;

    println!("Datastore ready.");
    println!("Default group: {}", default.name());
    println!("Groups: {}", datastore.cached_groups().len());
    Ok(())
}

fn run_groups(datastore: &Datastore, json: bool) -> Result<()> {
    let groups = datastore.cached_groups();

    if json {
        let views: Vec<GroupView> = groups
            .iter()
            .map(|group| group_view(datastore, group))
            .collect();
        println!("{}", serde_json::to_string_pretty(&views)?);
        return Ok(());
    }

    if groups.is_empty() {
        println!("No groups. Run 'orbit init' to create the default group.");
        return Ok(());
    }

    for group in &groups {
        let marker = if group.is_default() { " (default)" } else { "" };
        println!(
            "{:>6}  {}{}  [{} nodes]",
            group.sort_order(),
            group.name(),
            marker,
            group.effective_permissions().len()
        );
    }
    Ok(())
}

fn run_group(datastore: &Datastore, action: GroupAction, json: bool) -> Result<()> {
    match action {
        GroupAction::Show { name } => {
            let group = require_group(datastore, &name)?;
            print_group(datastore, &group, json)
        }
        GroupAction::Create {
            name,
            parents,
            permissions,
            sort_order,
            display_name,
        } => {
            if datastore.has_group(&name) {
                bail!("Group {name} already exists");
            }

            let mut record = GroupRecord::new(name.clone()).with_sort_order(sort_order);
            record.parents.extend(parents);
            record.permissions.extend(permissions);
            if let Some(display_name) = display_name {
                record.display.display_name = display_name;
            }

            if !datastore.insert_group(&record) {
                bail!("Failed to create group {name}; is sort order {sort_order} taken?");
            }
            info!(group = %name, "Created group");
            refresh(datastore)?;
            println!("Created group {name}.");
            Ok(())
        }
        GroupAction::Delete { name } => {
            if !datastore.delete_group(&name) {
                bail!("Group {name} not found");
            }
            refresh(datastore)?;
            println!("Deleted group {name}.");
            Ok(())
        }
        GroupAction::Grant { name, node } => edit_group(datastore, &name, |record| {
            record.permissions.insert(node.clone())
        }),
        GroupAction::Revoke { name, node } => {
            let group = require_group(datastore, &name)?;
            keep_one_node(group.own_permissions(), &node, &format!("group {name}"))?;
            edit_group(datastore, &name, |record| record.permissions.remove(&node))
        }
        GroupAction::Parent {
            name,
            parent,
            remove,
        } => {
            if !remove && parent == name {
                bail!("A group cannot inherit from itself");
            }
            edit_group(datastore, &name, |record| {
                if remove {
                    record.parents.remove(&parent)
                } else {
                    record.parents.insert(parent.clone())
                }
            })
        }
    }
}

/// An empty node set is stored as nothing and loads back as the fallback
/// node, so the last node is never revoked.
fn keep_one_node(own: &BTreeSet<String>, node: &str, target: &str) -> Result<()> {
    if own.len() == 1 && own.contains(node) {
        bail!(
            "Refusing to revoke {node}: it is the last node of {target}, which would load back \
             as '{FALLBACK_NODE}'. Grant another node first."
        );
    }
    Ok(())
}

/// Apply `edit` to the stored group and refresh the cache if anything changed.
fn edit_group(
    datastore: &Datastore,
    name: &str,
    edit: impl FnOnce(&mut GroupRecord) -> bool,
) -> Result<()> {
    let mut record = require_group(datastore, name)?.to_record();

    if !edit(&mut record) {
        println!("Group {name} unchanged.");
        return Ok(());
    }
    if !datastore.update_group(&record) {
        bail!("Failed to update group {name}");
    }
    refresh(datastore)?;
    println!("Updated group {name}.");
    Ok(())
}

fn run_subject(datastore: &Datastore, action: SubjectAction, json: bool) -> Result<()> {
    match action {
        SubjectAction::Show { id } => {
            let subject = datastore.subject_or_placeholder(id);
            print_subject(&subject, json)
        }
        SubjectAction::Assign { id, group, name } => {
            let group = require_group(datastore, &group)?;
            let mut subject = datastore.subject_or_placeholder(id);
            subject.set_group(group);
            if let Some(name) = name {
                subject.set_name(name);
            }
            save_subject(datastore, &mut subject)?;
            println!("Subject {id} is now in group {}.", subject.group_name());
            Ok(())
        }
        SubjectAction::Seen { id, name } => {
            let mut subject = datastore.subject_or_placeholder(id);
            if let Some(name) = name {
                subject.set_name(name);
            }
            subject.mark_seen();
            save_subject(datastore, &mut subject)?;
            println!("Marked subject {id} as seen.");
            Ok(())
        }
        SubjectAction::Grant { id, node } => {
            let mut subject = datastore.subject_or_placeholder(id);
            subject.grant(node.clone());
            save_subject(datastore, &mut subject)?;
            println!("Granted {node} to subject {id}.");
            Ok(())
        }
        SubjectAction::Revoke { id, node } => {
            let Some(mut subject) = datastore.get_subject(id) else {
                bail!("Subject {id} not found");
            };
            keep_one_node(&subject.own_permissions(), &node, &format!("subject {id}"))?;
            subject.revoke(&node);
            save_subject(datastore, &mut subject)?;
            println!("Revoked {node} from subject {id}.");
            Ok(())
        }
    }
}

fn save_subject(datastore: &Datastore, subject: &mut Subject) -> Result<()> {
    if !datastore.save_subject(subject) {
        bail!("Failed to save subject {}", subject.id());
    }
    debug!(subject = %subject.id(), "Saved subject");
    Ok(())
}

fn run_check(datastore: &Datastore, target: CheckTarget, json: bool) -> Result<()> {
    let (label, permission, allowed) = match target {
        CheckTarget::Group { name, permission } => {
            let group = require_group(datastore, &name)?;
            let allowed = group.has_permission(&permission);
            (format!("group {name}"), permission, allowed)
        }
        CheckTarget::Subject { id, permission } => {
            let subject = datastore.subject_or_placeholder(id);
            let allowed = Permissible::has_permission(&subject, &permission);
            (format!("subject {id}"), permission, allowed)
        }
    };

    if json {
        let view = CheckView {
            target: &label,
            permission: &permission,
            allowed,
        };
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        let verdict = if allowed { "allowed" } else { "denied" };
        println!("{permission} for {label}: {verdict}");
    }
    Ok(())
}

fn require_group(datastore: &Datastore, name: &str) -> Result<std::sync::Arc<Group>> {
    datastore
        .get_group(name)
        .with_context(|| format!("Group {name} not found"))
}

fn refresh(datastore: &Datastore) -> Result<()> {
    if !datastore.fetch_and_cache_groups() {
        bail!("Failed to reload groups");
    }
    Ok(())
}

fn group_view(datastore: &Datastore, group: &Group) -> GroupView {
    GroupView {
        record: group.to_record(),
        effective_permissions: group.effective_permissions(),
        unresolved_parents: datastore.unresolved_parents(group.name()),
    }
}

fn print_group(datastore: &Datastore, group: &Group, json: bool) -> Result<()> {
    let view = group_view(datastore, group);
    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    let record = &view.record;
    println!("Group: {}", record.name);
    println!("Display name: {}", record.display.display_name);
    println!("Default: {}", record.default_group);
    println!("Sort order: {}", record.sort_order);
    println!("Parents: {}", join(record.parents.iter()));
    println!("Own permissions: {}", join(record.permissions.iter()));
    println!("Effective permissions: {}", join(view.effective_permissions.iter()));
    if !view.unresolved_parents.is_empty() {
        println!("Missing parents: {}", join(view.unresolved_parents.iter()));
    }
    Ok(())
}

fn print_subject(subject: &Subject, json: bool) -> Result<()> {
    let view = SubjectView {
        id: subject.id(),
        name: subject.name().map(str::to_string),
        group: subject.group_name().to_string(),
        last_seen: subject.last_seen(),
        persisted: subject.is_persisted(),
        own_permissions: subject.own_permissions().into_iter().collect(),
        effective_permissions: Permissible::effective_permissions(subject),
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    println!("Subject: {}", view.id);
    if let Some(name) = &view.name {
        println!("Name: {name}");
    }
    println!("Group: {}", view.group);
    if let Some(last_seen) = view.last_seen {
        println!("Last seen: {}", last_seen.to_rfc3339());
    }
    if !view.persisted {
        println!("(not stored yet)");
    }
    println!("Own permissions: {}", join(view.own_permissions.iter()));
    for attachment in &view.effective_permissions {
        let sign = if attachment.value { "+" } else { "-" };
        println!("  {sign} {}", attachment.permission);
    }
    Ok(())
}

fn join<'a>(items: impl Iterator<Item = &'a String>) -> String {
    let joined: Vec<&str> = items.map(String::as_str).collect();
    if joined.is_empty() {
        "(none)".to_string()
    } else {
        joined.join(", ")
    }
}
