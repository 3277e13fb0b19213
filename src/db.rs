use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::Utc;
use regex::Regex;
use rusqlite::{Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use crate::reconcile::{CategoryId, CategorySet, MappingTable};
use crate::settings::{sanitize_mappings, Settings};

static SLUG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

pub const OPTION_MAPPINGS: &str = "btc_block_category_mappings";
pub const OPTION_SETTINGS: &str = "btc_settings";

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {:?}", dir))?;
    }
    let conn = Connection::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS posts (
            id          INTEGER PRIMARY KEY,
            post_type   TEXT NOT NULL DEFAULT 'post',
            status      TEXT NOT NULL DEFAULT 'publish',
            title       TEXT NOT NULL DEFAULT '',
            content     TEXT NOT NULL DEFAULT '',
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_posts_type_status ON posts(post_type, status);

        CREATE TABLE IF NOT EXISTS categories (
            id    INTEGER PRIMARY KEY,
            name  TEXT NOT NULL,
            slug  TEXT UNIQUE NOT NULL
        );

        CREATE TABLE IF NOT EXISTS post_categories (
            post_id      INTEGER NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
            category_id  INTEGER NOT NULL REFERENCES categories(id) ON DELETE CASCADE,
            UNIQUE(post_id, category_id)
        );
        CREATE INDEX IF NOT EXISTS idx_post_categories_post ON post_categories(post_id);

        CREATE TABLE IF NOT EXISTS options (
            name        TEXT PRIMARY KEY,
            value       TEXT NOT NULL,
            updated_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );
        ",
    )?;
    Ok(())
}

// ── Posts ──

#[derive(Debug, Clone)]
pub struct PostRow {
    pub id: i64,
    pub post_type: String,
    pub status: String,
    pub title: String,
    pub content: String,
}

pub struct NewPost<'a> {
    pub id: Option<i64>,
    pub post_type: &'a str,
    pub status: &'a str,
    pub title: &'a str,
    pub content: &'a str,
}

pub fn insert_post(conn: &Connection, post: &NewPost) -> Result<i64> {
    conn.execute(
        "INSERT INTO posts (id, post_type, status, title, content) VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![post.id, post.post_type, post.status, post.title, post.content],
    )
    .with_context(|| format!("Failed to insert post {:?}", post.title))?;
    Ok(conn.last_insert_rowid())
}

fn post_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PostRow> {
    Ok(PostRow {
        id: row.get(0)?,
        post_type: row.get(1)?,
        status: row.get(2)?,
        title: row.get(3)?,
        content: row.get(4)?,
    })
}

pub fn fetch_post(conn: &Connection, id: i64) -> Result<Option<PostRow>> {
    let post = conn
        .query_row(
            "SELECT id, post_type, status, title, content FROM posts WHERE id = ?1",
            [id],
            post_from_row,
        )
        .optional()?;
    Ok(post)
}

/// `(?1, ?2, …)` placeholders for the post types, numbered from `first`.
fn placeholders(count: usize, first: usize) -> String {
    (first..first + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Published posts of the given types, ordered by id, one page at a time.
pub fn fetch_published_batch(
    conn: &Connection,
    post_types: &[String],
    offset: usize,
    limit: usize,
) -> Result<Vec<PostRow>> {
    let sql = format!(
        "SELECT id, post_type, status, title, content
         FROM posts
         WHERE status = 'publish' AND post_type IN ({})
         ORDER BY id
         LIMIT {} OFFSET {}",
        placeholders(post_types.len(), 1),
        limit,
        offset
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(post_types), post_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn count_published(conn: &Connection, post_types: &[String]) -> Result<usize> {
    let sql = format!(
        "SELECT COUNT(*) FROM posts WHERE status = 'publish' AND post_type IN ({})",
        placeholders(post_types.len(), 1)
    );
    let count: usize =
        conn.query_row(&sql, rusqlite::params_from_iter(post_types), |r| r.get(0))?;
    Ok(count)
}

pub fn fetch_all_content(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT content FROM posts WHERE content != ''")?;
    let rows = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Categories ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryRow {
    pub id: CategoryId,
    pub name: String,
    pub slug: String,
}

pub fn slugify(name: &str) -> String {
    SLUG_RE
        .replace_all(&name.to_lowercase(), "-")
        .trim_matches('-')
        .to_string()
}

pub fn insert_category(
    conn: &Connection,
    id: Option<CategoryId>,
    name: &str,
    slug: Option<&str>,
) -> Result<CategoryId> {
    let slug = slug.map_or_else(|| slugify(name), str::to_string);
    conn.execute(
        "INSERT INTO categories (id, name, slug) VALUES (?1, ?2, ?3)",
        rusqlite::params![id, name, slug],
    )
    .with_context(|| format!("Failed to insert category {:?}", name))?;
    Ok(conn.last_insert_rowid() as CategoryId)
}

pub fn fetch_categories(conn: &Connection) -> Result<Vec<CategoryRow>> {
    let mut stmt = conn.prepare("SELECT id, name, slug FROM categories ORDER BY name")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(CategoryRow {
                id: row.get(0)?,
                name: row.get(1)?,
                slug: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// The ids in `ids` that do not name an existing category.
pub fn missing_categories(conn: &Connection, ids: &CategorySet) -> Result<Vec<CategoryId>> {
    let mut stmt = conn.prepare("SELECT 1 FROM categories WHERE id = ?1")?;
    let mut missing = Vec::new();
    for &id in ids {
        if !stmt.exists([id])? {
            missing.push(id);
        }
    }
    Ok(missing)
}

// ── Post ↔ category assignments ──

pub fn post_categories(conn: &Connection, post_id: i64) -> Result<CategorySet> {
    let mut stmt = conn.prepare("SELECT category_id FROM post_categories WHERE post_id = ?1")?;
    let ids = stmt
        .query_map([post_id], |row| row.get(0))?
        .collect::<Result<CategorySet, _>>()?;
    Ok(ids)
}

/// Replace the category assignment of each post, all in one transaction.
pub fn save_post_categories(conn: &Connection, rows: &[(i64, CategorySet)]) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    write_assignments(&tx, rows)?;
    tx.commit()?;
    Ok(())
}

fn write_assignments(conn: &Connection, rows: &[(i64, CategorySet)]) -> Result<()> {
    let mut delete = conn.prepare("DELETE FROM post_categories WHERE post_id = ?1")?;
    let mut insert =
        conn.prepare("INSERT OR IGNORE INTO post_categories (post_id, category_id) VALUES (?1, ?2)")?;
    for (post_id, categories) in rows {
        delete.execute([post_id])?;
        for category_id in categories {
            insert
                .execute(rusqlite::params![post_id, category_id])
                .with_context(|| format!("Failed to assign category {} to post {}", category_id, post_id))?;
        }
    }
    Ok(())
}

// ── Import ──

pub struct NewCategory<'a> {
    pub id: Option<CategoryId>,
    pub name: &'a str,
    pub slug: Option<&'a str>,
}

/// Insert categories, posts and the posts' initial assignments as one unit.
/// Any failure (duplicate id or slug, unknown category) leaves the store untouched.
pub fn import_content(
    conn: &Connection,
    categories: &[NewCategory],
    posts: &[(NewPost, CategorySet)],
) -> Result<Vec<i64>> {
    let tx = conn.unchecked_transaction()?;

    for c in categories {
        insert_category(&tx, c.id, c.name, c.slug)?;
    }

    let mut post_ids = Vec::with_capacity(posts.len());
    let mut assignments = Vec::new();
    for (post, post_categories) in posts {
        let id = insert_post(&tx, post)?;
        if !post_categories.is_empty() {
            assignments.push((id, post_categories.clone()));
        }
        post_ids.push(id);
    }
    write_assignments(&tx, &assignments)?;

    tx.commit()?;
    info!(
        categories = categories.len(),
        posts = post_ids.len(),
        "Imported content"
    );
    Ok(post_ids)
}

// ── Options ──

/// Read a JSON option, falling back to `T::default()` when it is missing or unreadable.
pub fn get_option<T>(conn: &Connection, name: &str) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let raw: Option<String> = conn
        .query_row("SELECT value FROM options WHERE name = ?1", [name], |r| r.get(0))
        .optional()?;
    let Some(raw) = raw else {
        return Ok(T::default());
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Ok(value),
        Err(e) => {
            warn!("Option {} is not readable, using defaults: {}", name, e);
            Ok(T::default())
        }
    }
}

pub fn set_option<T: Serialize>(conn: &Connection, name: &str, value: &T) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO options (name, value, updated_at) VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        rusqlite::params![name, raw],
    )?;
    Ok(())
}

pub fn load_mappings(conn: &Connection) -> Result<MappingTable> {
    get_option(conn, OPTION_MAPPINGS)
}

pub fn save_mappings(conn: &Connection, mappings: MappingTable) -> Result<MappingTable> {
    let mappings = sanitize_mappings(mappings);
    set_option(conn, OPTION_MAPPINGS, &mappings)?;
    info!("Saved {} block mappings", mappings.len());
    Ok(mappings)
}

pub fn load_settings(conn: &Connection) -> Result<Settings> {
    get_option(conn, OPTION_SETTINGS)
}

pub fn save_settings(conn: &Connection, settings: &Settings) -> Result<Settings> {
    let stamped = Settings {
        updated_at: Some(Utc::now()),
        ..settings.clone()
    };
    set_option(conn, OPTION_SETTINGS, &stamped)?;
    Ok(stamped)
}

// ── Stats ──

pub struct Stats {
    pub posts: usize,
    pub published: usize,
    pub categories: usize,
    pub assignments: usize,
    pub uncategorized: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let posts: usize = conn.query_row("SELECT COUNT(*) FROM posts", [], |r| r.get(0))?;
    let published: usize = conn.query_row(
        "SELECT COUNT(*) FROM posts WHERE status = 'publish'",
        [],
        |r| r.get(0),
    )?;
    let categories: usize = conn.query_row("SELECT COUNT(*) FROM categories", [], |r| r.get(0))?;
    let assignments: usize =
        conn.query_row("SELECT COUNT(*) FROM post_categories", [], |r| r.get(0))?;
    let uncategorized: usize = conn.query_row(
        "SELECT COUNT(*) FROM posts p
         WHERE NOT EXISTS (SELECT 1 FROM post_categories pc WHERE pc.post_id = p.id)",
        [],
        |r| r.get(0),
    )?;
    Ok(Stats {
        posts,
        published,
        categories,
        assignments,
        uncategorized,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn memory_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    pub(crate) fn post(conn: &Connection, post_type: &str, status: &str, content: &str) -> i64 {
        insert_post(
            conn,
            &NewPost {
                id: None,
                post_type,
                status,
                title: "",
                content,
            },
        )
        .unwrap()
    }

    fn new_post(id: i64, content: &str) -> NewPost<'_> {
        NewPost {
            id: Some(id),
            post_type: "post",
            status: "publish",
            title: "",
            content,
        }
    }

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn import_commits_everything_together() {
        let conn = memory_db();
        let categories = [NewCategory { id: Some(5), name: "Tables", slug: None }];
        let posts = [
            (new_post(1, "<!-- wp:table /-->"), CategorySet::from([5])),
            (new_post(2, ""), CategorySet::new()),
        ];
        let ids = import_content(&conn, &categories, &posts).unwrap();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(post_categories(&conn, 1).unwrap(), CategorySet::from([5]));
        assert_eq!(count(&conn, "posts"), 2);
    }

    #[test]
    fn import_with_unknown_category_rolls_back() {
        let conn = memory_db();
        let categories = [NewCategory { id: Some(5), name: "Tables", slug: None }];
        let posts = [
            (new_post(1, ""), CategorySet::from([5])),
            (new_post(2, ""), CategorySet::from([99])),
        ];
        assert!(import_content(&conn, &categories, &posts).is_err());
        assert_eq!(count(&conn, "categories"), 0);
        assert_eq!(count(&conn, "posts"), 0);
        assert_eq!(count(&conn, "post_categories"), 0);

        // Nothing half-imported, so a corrected file goes through.
        let posts = [(new_post(1, ""), CategorySet::from([5])), (new_post(2, ""), CategorySet::new())];
        assert_eq!(import_content(&conn, &categories, &posts).unwrap(), vec![1, 2]);
    }

    #[test]
    fn schema_is_idempotent() {
        let conn = memory_db();
        init_schema(&conn).unwrap();
    }

    #[test]
    fn slugs() {
        assert_eq!(slugify("Video & Audio"), "video-audio");
        assert_eq!(slugify("  Recipes!  "), "recipes");
    }

    #[test]
    fn categories_roundtrip() {
        let conn = memory_db();
        let tables = insert_category(&conn, Some(5), "Tables", None).unwrap();
        let video = insert_category(&conn, None, "Video", Some("vids")).unwrap();
        assert_eq!(tables, 5);
        assert!(video > 5);

        let cats = fetch_categories(&conn).unwrap();
        assert_eq!(cats.len(), 2);
        assert_eq!(cats[0].slug, "tables");
        assert_eq!(cats[1].slug, "vids");

        let missing = missing_categories(&conn, &CategorySet::from([5, 999])).unwrap();
        assert_eq!(missing, vec![999]);
    }

    #[test]
    fn assignments_replace_previous() {
        let conn = memory_db();
        for id in 1..=3 {
            insert_category(&conn, Some(id), &format!("Cat {}", id), None).unwrap();
        }
        let p = post(&conn, "post", "publish", "");

        save_post_categories(&conn, &[(p, CategorySet::from([1, 2]))]).unwrap();
        assert_eq!(post_categories(&conn, p).unwrap(), CategorySet::from([1, 2]));

        save_post_categories(&conn, &[(p, CategorySet::from([3]))]).unwrap();
        assert_eq!(post_categories(&conn, p).unwrap(), CategorySet::from([3]));
    }

    #[test]
    fn published_batches_filter_and_page() {
        let conn = memory_db();
        let a = post(&conn, "post", "publish", "a");
        post(&conn, "page", "publish", "page");
        post(&conn, "post", "draft", "draft");
        let b = post(&conn, "post", "publish", "b");
        let c = post(&conn, "post", "publish", "c");

        let types = vec!["post".to_string()];
        assert_eq!(count_published(&conn, &types).unwrap(), 3);

        let first: Vec<i64> = fetch_published_batch(&conn, &types, 0, 2)
            .unwrap()
            .iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(first, vec![a, b]);

        let rest: Vec<i64> = fetch_published_batch(&conn, &types, 2, 2)
            .unwrap()
            .iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(rest, vec![c]);

        let both = vec!["post".to_string(), "page".to_string()];
        assert_eq!(count_published(&conn, &both).unwrap(), 4);
    }

    #[test]
    fn options_default_when_missing_or_corrupt() {
        let conn = memory_db();
        assert!(load_mappings(&conn).unwrap().is_empty());
        assert_eq!(load_settings(&conn).unwrap(), Settings::default());

        conn.execute(
            "INSERT INTO options (name, value) VALUES (?1, 'not json')",
            [OPTION_SETTINGS],
        )
        .unwrap();
        assert_eq!(load_settings(&conn).unwrap(), Settings::default());
    }

    #[test]
    fn mappings_and_settings_persist() {
        let conn = memory_db();
        let mut mappings = MappingTable::new();
        mappings.insert("core/table".into(), CategorySet::from([5]));
        mappings.insert("core/list".into(), CategorySet::new());
        let saved = save_mappings(&conn, mappings).unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(load_mappings(&conn).unwrap(), saved);

        let settings = Settings {
            remove_categories_on_block_removal: true,
            ..Default::default()
        };
        let stamped = save_settings(&conn, &settings).unwrap();
        assert!(stamped.updated_at.is_some());
        let loaded = load_settings(&conn).unwrap();
        assert!(loaded.remove_categories_on_block_removal);
        assert_eq!(loaded, stamped);
    }

    #[test]
    fn stats_count_rows() {
        let conn = memory_db();
        insert_category(&conn, Some(1), "One", None).unwrap();
        let p = post(&conn, "post", "publish", "");
        post(&conn, "post", "draft", "");
        save_post_categories(&conn, &[(p, CategorySet::from([1]))]).unwrap();

        let s = get_stats(&conn).unwrap();
        assert_eq!(s.posts, 2);
        assert_eq!(s.published, 1);
        assert_eq!(s.categories, 1);
        assert_eq!(s.assignments, 1);
        assert_eq!(s.uncategorized, 1);
    }
}
