use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, ensure, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::Connection;
use serde::Deserialize;

use blocks_to_category::config::AppConfig;
use blocks_to_category::db::{self, NewCategory, NewPost};
use blocks_to_category::embeds;
use blocks_to_category::processor::{self, SaveContext, SaveOutcome};
use blocks_to_category::reconcile::{CategoryId, CategorySet};
use blocks_to_category::settings;

#[derive(Parser)]
#[command(name = "blocks_to_category", about = "Assign post categories from the blocks they contain")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    Init,
    /// Load posts and categories from a JSON file
    Import {
        file: PathBuf,
        /// Run the save hook on every imported post
        #[arg(long)]
        process: bool,
    },
    /// Add a category
    Category {
        name: String,
        #[arg(long)]
        slug: Option<String>,
        #[arg(long)]
        id: Option<CategoryId>,
    },
    /// List categories
    Categories,
    /// Map a block identifier (e.g. core/table, core/embed:youtube) to categories
    Map {
        block: String,
        #[arg(required = true)]
        categories: Vec<CategoryId>,
    },
    /// Remove the mapping for a block identifier
    Unmap { block: String },
    /// Show the mapping table, or replace it from a JSON file
    Mappings {
        #[arg(long)]
        load: Option<PathBuf>,
    },
    /// Show or change the removal policy
    Settings {
        /// Remove mapped categories when their block leaves a post
        #[arg(long)]
        remove_on_block_removal: Option<bool>,
        /// With removal on, keep categories a remaining block still maps to
        #[arg(long)]
        keep_shared_categories: Option<bool>,
    },
    /// List block identifiers available for mapping
    Blocks,
    /// Run the save hook for one post
    Save {
        post_id: i64,
        #[arg(long)]
        autosave: bool,
        #[arg(long)]
        revision: bool,
    },
    /// Recompute categories for all published posts
    Migrate {
        /// Resume from this many already-processed posts
        #[arg(long, default_value = "0")]
        offset: usize,
        /// Posts per batch (default: from config)
        #[arg(short = 'n', long)]
        batch_size: Option<usize>,
    },
    /// Show database statistics
    Stats,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ImportFile {
    categories: Vec<ImportCategory>,
    posts: Vec<ImportPost>,
}

#[derive(Deserialize)]
struct ImportCategory {
    id: Option<CategoryId>,
    name: String,
    slug: Option<String>,
}

#[derive(Deserialize)]
struct ImportPost {
    id: Option<i64>,
    #[serde(default = "default_post_type")]
    post_type: String,
    #[serde(default = "default_status")]
    status: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    categories: CategorySet,
}

fn default_post_type() -> String {
    "post".to_string()
}

fn default_status() -> String {
    "publish".to_string()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let cfg = AppConfig::load()?;
    let conn = db::connect(&cfg.db_path)?;
    db::init_schema(&conn)?;

    let result = match cli.command {
        Commands::Init => {
            println!("Database ready at {:?}", cfg.db_path);
            Ok(())
        }
        Commands::Import { file, process } => import(&conn, &cfg, &file, process),
        Commands::Category { name, slug, id } => {
            let id = db::insert_category(&conn, id, &name, slug.as_deref())?;
            println!("Added category {} ({})", name, id);
            Ok(())
        }
        Commands::Categories => {
            let cats = db::fetch_categories(&conn)?;
            if cats.is_empty() {
                println!("No categories. Add one with 'category <name>'.");
                return Ok(());
            }
            println!("{:>5} | {:<24} | {:<24}", "ID", "Name", "Slug");
            println!("{}", "-".repeat(59));
            for c in &cats {
                println!(
                    "{:>5} | {:<24} | {:<24}",
                    c.id,
                    truncate(&c.name, 24),
                    truncate(&c.slug, 24)
                );
            }
            Ok(())
        }
        Commands::Map { block, categories } => {
            let ids: CategorySet = categories.into_iter().collect();
            let missing = db::missing_categories(&conn, &ids)?;
            if !missing.is_empty() {
                bail!("Unknown category ids: {:?}", missing);
            }
            let mut mappings = db::load_mappings(&conn)?;
            mappings.insert(block.clone(), ids.clone());
            db::save_mappings(&conn, mappings)?;
            println!("{} -> {:?}", block, ids);
            Ok(())
        }
        Commands::Unmap { block } => {
            let mut mappings = db::load_mappings(&conn)?;
            if mappings.remove(&block).is_none() {
                println!("{} was not mapped.", block);
                return Ok(());
            }
            db::save_mappings(&conn, mappings)?;
            println!("Removed mapping for {}", block);
            Ok(())
        }
        Commands::Mappings { load } => {
            if let Some(path) = load {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {:?}", path))?;
                let mappings = settings::parse_mappings(&raw)?;
                let ids: CategorySet = mappings.values().flatten().copied().collect();
                let missing = db::missing_categories(&conn, &ids)?;
                if !missing.is_empty() {
                    bail!("Unknown category ids: {:?}", missing);
                }
                db::save_mappings(&conn, mappings)?;
            }
            print_mappings(&conn)
        }
        Commands::Settings {
            remove_on_block_removal,
            keep_shared_categories,
        } => {
            let mut current = db::load_settings(&conn)?;
            if remove_on_block_removal.is_some() || keep_shared_categories.is_some() {
                if let Some(v) = remove_on_block_removal {
                    current.remove_categories_on_block_removal = v;
                }
                if let Some(v) = keep_shared_categories {
                    current.keep_shared_categories = v;
                }
                current = db::save_settings(&conn, &current)?;
            }
            println!(
                "remove_categories_on_block_removal: {}",
                current.remove_categories_on_block_removal
            );
            println!("keep_shared_categories:             {}", current.keep_shared_categories);
            println!("removal policy:                     {:?}", current.removal_policy());
            if let Some(at) = current.updated_at {
                println!("updated:                            {}", at.to_rfc3339());
            }
            Ok(())
        }
        Commands::Blocks => {
            let seen = processor::seen_block_names(&conn)?;
            let mappings = db::load_mappings(&conn)?;
            let names = category_names(&conn)?;
            for b in embeds::available_blocks(seen) {
                let mapped = mappings
                    .get(&b.name)
                    .map(|ids| describe_categories(ids, &names))
                    .unwrap_or_default();
                println!("{:<32} | {:<28} | {}", truncate(&b.name, 32), truncate(&b.title, 28), mapped);
            }
            Ok(())
        }
        Commands::Save {
            post_id,
            autosave,
            revision,
        } => {
            let ctx = SaveContext { autosave, revision };
            match processor::on_post_save(&conn, post_id, ctx, &cfg)? {
                SaveOutcome::Skipped(reason) => println!("Skipped post {}: {:?}", post_id, reason),
                SaveOutcome::Unchanged => println!("Post {}: categories unchanged", post_id),
                SaveOutcome::Updated(diff) => println!(
                    "Post {}: added {:?}, removed {:?}",
                    post_id, diff.added, diff.removed
                ),
            }
            Ok(())
        }
        Commands::Migrate { offset, batch_size } => {
            let batch_size = batch_size.unwrap_or(cfg.batch_size);
            ensure!(batch_size > 0, "batch size must be at least 1");
            migrate(&conn, &cfg, offset, batch_size)
        }
        Commands::Stats => {
            let s = db::get_stats(&conn)?;
            let mappings = db::load_mappings(&conn)?;
            println!("Posts:         {}", s.posts);
            println!("Published:     {}", s.published);
            println!("Categories:    {}", s.categories);
            println!("Assignments:   {}", s.assignments);
            println!("Uncategorized: {}", s.uncategorized);
            println!("Mappings:      {}", mappings.len());
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed >= Duration::from_millis(500) {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn import(conn: &Connection, cfg: &AppConfig, file: &Path, process: bool) -> Result<()> {
    let raw = std::fs::read_to_string(file).with_context(|| format!("Failed to read {:?}", file))?;
    let data: ImportFile =
        serde_json::from_str(&raw).with_context(|| format!("Invalid import file {:?}", file))?;

    let categories: Vec<NewCategory> = data
        .categories
        .iter()
        .map(|c| NewCategory {
            id: c.id,
            name: &c.name,
            slug: c.slug.as_deref(),
        })
        .collect();
    let posts: Vec<(NewPost, CategorySet)> = data
        .posts
        .iter()
        .map(|p| {
            let post = NewPost {
                id: p.id,
                post_type: &p.post_type,
                status: &p.status,
                title: &p.title,
                content: &p.content,
            };
            (post, p.categories.clone())
        })
        .collect();
    let post_ids = db::import_content(conn, &categories, &posts)
        .with_context(|| format!("Import of {:?} failed, nothing was written", file))?;
    println!(
        "Imported {} categories and {} posts.",
        data.categories.len(),
        post_ids.len()
    );

    if process {
        let mut updated = 0;
        for id in post_ids {
            if let SaveOutcome::Updated(_) =
                processor::on_post_save(conn, id, SaveContext::default(), cfg)?
            {
                updated += 1;
            }
        }
        println!("Updated categories on {} posts.", updated);
    }
    Ok(())
}

fn migrate(conn: &Connection, cfg: &AppConfig, offset: usize, batch_size: usize) -> Result<()> {
    let total = db::count_published(conn, &cfg.post_types)?;
    if total == 0 {
        println!("No published posts to process.");
        return Ok(());
    }

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );
    pb.set_position(offset.min(total) as u64);

    let mut offset = offset;
    let mut updated = 0;
    let last = loop {
        let progress = processor::process_batch(conn, offset, batch_size, cfg)?;
        updated += progress.updated;
        pb.set_length(progress.total as u64);
        pb.set_position(progress.completed.min(progress.total) as u64);
        pb.set_message(progress.message.clone());

        if !progress.continue_processing {
            break progress;
        }
        offset = progress.completed;
    };

    pb.finish_and_clear();
    println!(
        "Complete! Processed {} of {} posts, updated {}.",
        last.completed.min(last.total),
        last.total,
        updated
    );
    Ok(())
}

fn category_names(conn: &Connection) -> Result<HashMap<CategoryId, String>> {
    Ok(db::fetch_categories(conn)?
        .into_iter()
        .map(|c| (c.id, c.name))
        .collect())
}

fn describe_categories(ids: &CategorySet, names: &HashMap<CategoryId, String>) -> String {
    ids.iter()
        .map(|id| match names.get(id) {
            Some(name) => format!("{} ({})", name, id),
            None => format!("#{}", id),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_mappings(conn: &Connection) -> Result<()> {
    let mappings = db::load_mappings(conn)?;
    if mappings.is_empty() {
        println!("No mappings. Add one with 'map <block> <category ids...>'.");
        return Ok(());
    }
    let names = category_names(conn)?;
    for (block, ids) in &mappings {
        println!("{:<32} | {}", truncate(block, 32), describe_categories(ids, &names));
    }
    Ok(())
}

/// Fit `s` into a table column of `width` characters, marking a cut with `…`.
fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        return s.to_string();
    }
    let mut cut: String = s.chars().take(width.saturating_sub(1)).collect();
    cut.push('…');
    cut
}

/// Elapsed time of a command: milliseconds for quick runs, then seconds,
/// then minutes with zero-padded seconds for long migrations.
fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    match secs {
        0 => format!("{}ms", d.as_millis()),
        1..=59 => format!("{:.1}s", d.as_secs_f64()),
        _ => format!("{}m {:02}s", secs / 60, secs % 60),
    }
}
