//! SQLite-backed [`Store`].

use std::path::Path;

use hashbrown::HashSet;
use rusqlite::{
    Connection, ErrorCode, OptionalExtension, Row, ToSql, params, params_from_iter,
};
use time::OffsetDateTime;

use crate::types::{Did, FeedVersion, Seq};

use super::{
    Store, StoreError, StoreResult,
    models::{
        Actor, DeferredOp, Like, Post, PostScore, QueuedUnknown, ServedPost, UnknownKind,
        UnknownThing,
    },
};

/// Largest number of keys bound into one `IN (...)` list.
const IN_CHUNK: usize = 500;

const ACTOR_COLUMNS: &str = "did, handle, display_name, description, is_muted, \
    is_external_to_network, manual_include_in_network, manual_include_in_focus, \
    flagged_for_manual_review, autolabel_fem_vibes, autolabel_nb_vibes, autolabel_masc_vibes, \
    follower_count, following_count, is_deleted";

const POST_COLUMNS: &str = "uri, cid, author, text, indexed_at_ms, reply_parent, reply_root, \
    embed_uri, embed_cid, media_count, media_with_alt_text_count, labels, like_count, is_pinned, \
    is_deleted, last_rescan_ms";

const LIKE_COLUMNS: &str =
    "uri, cid, liker, post_uri, post_cid, created_at_ms, attributed_feed";

/// SQLite implementation of [`Store`].
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Opens or creates a database at `path`.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self { conn })
    }

    fn query_in<T>(
        &self,
        sql_prefix: &str,
        keys: &[String],
        map: impl Fn(&Row<'_>) -> rusqlite::Result<T>,
    ) -> StoreResult<Vec<T>> {
        let mut out = Vec::new();
        for chunk in keys.chunks(IN_CHUNK) {
            let sql = format!("{sql_prefix} ({})", placeholders(chunk.len()));
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), &map)?;
            for row in rows {
                out.push(row?);
            }
        }
        Ok(out)
    }
}

impl Store for SqliteStore {
    fn load_cursor(&self, service: &str) -> StoreResult<Option<Seq>> {
        let cursor: Option<i64> = self
            .conn
            .query_row(
                "SELECT cursor FROM subscription_state WHERE service = ?1",
                params![service],
                |row| row.get(0),
            )
            .optional()?;
        Ok(cursor.map(|c| c as Seq))
    }

    fn save_cursor(&mut self, service: &str, cursor: Seq) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO subscription_state(service, cursor) VALUES (?1, ?2)
             ON CONFLICT(service) DO UPDATE SET cursor = MAX(cursor, excluded.cursor)",
            params![service, cursor as i64],
        )?;
        Ok(())
    }

    fn actors_by_did(&self, dids: &[Did]) -> StoreResult<Vec<Actor>> {
        self.query_in(
            &format!("SELECT {ACTOR_COLUMNS} FROM actor WHERE did IN"),
            dids,
            actor_from_row,
        )
    }

    fn put_actor(&mut self, actor: &Actor) -> StoreResult<()> {
        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO actor({ACTOR_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params_from_iter(actor_values(actor)),
        )?;
        Ok(())
    }

    fn upsert_observed_actor(&mut self, actor: &Actor) -> StoreResult<bool> {
        let tx = self.conn.transaction()?;
        let inserted = tx.execute(
            &format!(
                "INSERT OR IGNORE INTO actor({ACTOR_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params_from_iter(actor_values(actor)),
        )?;
        if inserted == 0 {
            tx.execute(
                "UPDATE actor SET handle = ?2, display_name = ?3, description = ?4,
                    autolabel_fem_vibes = ?5, autolabel_nb_vibes = ?6, autolabel_masc_vibes = ?7,
                    follower_count = ?8, following_count = ?9, is_deleted = 0
                 WHERE did = ?1",
                params![
                    actor.did,
                    actor.handle,
                    actor.display_name,
                    actor.description,
                    actor.autolabel_fem_vibes,
                    actor.autolabel_nb_vibes,
                    actor.autolabel_masc_vibes,
                    actor.follower_count,
                    actor.following_count,
                ],
            )?;
        }
        tx.commit()?;
        Ok(inserted > 0)
    }

    fn tombstone_actors(&mut self, dids: &[Did]) -> StoreResult<usize> {
        let tx = self.conn.transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO actor(did, handle, is_external_to_network, is_deleted)
                 VALUES (?1, ?1, 1, 1)
                 ON CONFLICT(did) DO UPDATE SET is_deleted = 1",
            )?;
            for did in dids {
                count += stmt.execute(params![did])?;
            }
        }
        tx.commit()?;
        Ok(count)
    }

    fn post_authors(&self, uris: &[String]) -> StoreResult<Vec<(String, Did)>> {
        self.query_in("SELECT uri, author FROM post WHERE uri IN", uris, |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
    }

    fn posts_by_uri(&self, uris: &[String]) -> StoreResult<Vec<Post>> {
        self.query_in(
            &format!("SELECT {POST_COLUMNS} FROM post WHERE uri IN"),
            uris,
            post_from_row,
        )
    }

    fn insert_posts(&mut self, posts: &[Post]) -> StoreResult<usize> {
        let tx = self.conn.transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT OR IGNORE INTO post({POST_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
            ))?;
            for post in posts {
                let labels = serde_json::to_string(&post.labels)?;
                count += stmt.execute(params![
                    post.uri,
                    post.cid,
                    post.author,
                    post.text,
                    to_ms(post.indexed_at),
                    post.reply_parent,
                    post.reply_root,
                    post.embed_uri,
                    post.embed_cid,
                    post.media_count,
                    post.media_with_alt_text_count,
                    labels,
                    post.like_count,
                    post.is_pinned,
                    post.is_deleted,
                    post.last_rescan.map(to_ms),
                ])?;
            }
        }
        tx.commit()?;
        Ok(count)
    }

    fn upsert_post(&mut self, post: &Post) -> StoreResult<()> {
        let labels = serde_json::to_string(&post.labels)?;
        self.conn.execute(
            &format!(
                "INSERT INTO post({POST_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                 ON CONFLICT(uri) DO UPDATE SET
                    cid = excluded.cid,
                    text = excluded.text,
                    media_count = excluded.media_count,
                    media_with_alt_text_count = excluded.media_with_alt_text_count,
                    labels = excluded.labels,
                    like_count = excluded.like_count,
                    last_rescan_ms = excluded.last_rescan_ms"
            ),
            params![
                post.uri,
                post.cid,
                post.author,
                post.text,
                to_ms(post.indexed_at),
                post.reply_parent,
                post.reply_root,
                post.embed_uri,
                post.embed_cid,
                post.media_count,
                post.media_with_alt_text_count,
                labels,
                post.like_count,
                post.is_pinned,
                post.is_deleted,
                post.last_rescan.map(to_ms),
            ],
        )?;
        Ok(())
    }

    fn soft_delete_posts(&mut self, uris: &[String]) -> StoreResult<usize> {
        let tx = self.conn.transaction()?;
        let mut count = 0;
        for chunk in uris.chunks(IN_CHUNK) {
            let sql = format!(
                "UPDATE post SET is_deleted = 1 WHERE is_deleted = 0 AND uri IN ({})",
                placeholders(chunk.len())
            );
            count += tx.execute(&sql, params_from_iter(chunk.iter()))?;
        }
        tx.commit()?;
        Ok(count)
    }

    fn set_pinned(&mut self, uri: &str, pinned: bool) -> StoreResult<bool> {
        let changed = self.conn.execute(
            "UPDATE post SET is_pinned = ?2 WHERE uri = ?1",
            params![uri, pinned],
        )?;
        Ok(changed > 0)
    }

    fn posts_between(&self, since: OffsetDateTime, until: OffsetDateTime) -> StoreResult<Vec<Post>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {POST_COLUMNS} FROM post
             WHERE indexed_at_ms > ?1 AND indexed_at_ms < ?2 AND is_deleted = 0 AND is_pinned = 0"
        ))?;
        let rows = stmt.query_map(params![to_ms(since), to_ms(until)], post_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn pinned_posts(&self) -> StoreResult<Vec<Post>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {POST_COLUMNS} FROM post
             WHERE is_pinned = 1 AND is_deleted = 0
             ORDER BY indexed_at_ms DESC"
        ))?;
        let rows = stmt.query_map([], post_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn stale_posts(
        &self,
        uris: &[String],
        indexed_before: OffsetDateTime,
        rescan_before: OffsetDateTime,
        limit: usize,
    ) -> StoreResult<Vec<String>> {
        let indexed_before = to_ms(indexed_before);
        let rescan_before = to_ms(rescan_before);
        let mut stale = HashSet::new();
        for chunk in uris.chunks(IN_CHUNK) {
            let sql = format!(
                "SELECT uri FROM post
                 WHERE indexed_at_ms < ?1
                   AND reply_root IS NULL
                   AND is_deleted = 0
                   AND (last_rescan_ms IS NULL OR last_rescan_ms < ?2)
                   AND uri IN ({})",
                numbered_placeholders(3, chunk.len())
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let mut bound: Vec<rusqlite::types::Value> = vec![indexed_before.into(), rescan_before.into()];
            bound.extend(chunk.iter().map(|u| rusqlite::types::Value::Text(u.clone())));
            let rows = stmt.query_map(params_from_iter(bound.iter()), |row| row.get::<_, String>(0))?;
            for row in rows {
                stale.insert(row?);
            }
        }
        Ok(uris
            .iter()
            .filter(|u| stale.contains(u.as_str()))
            .take(limit)
            .cloned()
            .collect())
    }

    fn insert_likes(&mut self, likes: &[Like]) -> StoreResult<usize> {
        let tx = self.conn.transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT OR IGNORE INTO post_like({LIKE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
            ))?;
            for like in likes {
                count += stmt.execute(params![
                    like.uri,
                    like.cid,
                    like.liker,
                    like.post_uri,
                    like.post_cid,
                    to_ms(like.created_at),
                    like.attributed_feed,
                ])?;
            }
        }
        tx.commit()?;
        Ok(count)
    }

    fn delete_likes(&mut self, uris: &[String]) -> StoreResult<usize> {
        let tx = self.conn.transaction()?;
        let mut count = 0;
        for chunk in uris.chunks(IN_CHUNK) {
            let sql = format!("DELETE FROM post_like WHERE uri IN ({})", placeholders(chunk.len()));
            count += tx.execute(&sql, params_from_iter(chunk.iter()))?;
        }
        tx.commit()?;
        Ok(count)
    }

    fn likes_by_uri(&self, uris: &[String]) -> StoreResult<Vec<Like>> {
        self.query_in(
            &format!("SELECT {LIKE_COLUMNS} FROM post_like WHERE uri IN"),
            uris,
            like_from_row,
        )
    }

    fn likes_between(&self, since: OffsetDateTime, until: OffsetDateTime) -> StoreResult<Vec<Like>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LIKE_COLUMNS} FROM post_like WHERE created_at_ms > ?1 AND created_at_ms < ?2"
        ))?;
        let rows = stmt.query_map(params![to_ms(since), to_ms(until)], like_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn record_served(&mut self, served: &[ServedPost]) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO served_post(feed_name, post_uri, client_did, served_at_ms)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for s in served {
                stmt.execute(params![s.feed_name, s.post_uri, s.client_did, to_ms(s.served_at)])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn served_feed(
        &self,
        post_uri: &str,
        client: &str,
        since: OffsetDateTime,
    ) -> StoreResult<Option<String>> {
        let feed = self
            .conn
            .query_row(
                "SELECT feed_name FROM served_post
                 WHERE post_uri = ?1 AND client_did = ?2 AND served_at_ms >= ?3
                 ORDER BY served_at_ms DESC LIMIT 1",
                params![post_uri, client, to_ms(since)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(feed)
    }

    fn enqueue_unknown(&mut self, things: &[UnknownThing]) -> StoreResult<usize> {
        let now = to_ms(OffsetDateTime::now_utc());
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        {
            let mut insert = tx.prepare(
                "INSERT OR IGNORE INTO unknown_thing(identifier, kind, payload, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            let mut attach = tx.prepare(
                "UPDATE unknown_thing SET payload = ?3
                 WHERE identifier = ?1 AND kind = ?2 AND payload IS NULL",
            )?;
            for thing in things {
                let payload = thing.payload.as_ref().map(serde_json::to_string).transpose()?;
                let n = insert.execute(params![thing.identifier, thing.kind.as_str(), payload, now])?;
                if n == 0 && payload.is_some() {
                    attach.execute(params![thing.identifier, thing.kind.as_str(), payload])?;
                }
                inserted += n;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn unknown_page(&self, after_id: i64, limit: usize) -> StoreResult<Vec<QueuedUnknown>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, identifier, kind, payload, created_at_ms FROM unknown_thing
             WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![after_id, limit as i64], |row| {
            let kind: String = row.get(2)?;
            let payload: Option<String> = row.get(3)?;
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                kind,
                payload,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, identifier, kind, payload, created_at_ms) = row?;
            let Some(kind) = UnknownKind::parse(&kind) else {
                return Err(StoreError::Message(format!("unknown queue kind {kind:?} on row {id}")));
            };
            let payload = payload
                .as_deref()
                .map(serde_json::from_str::<DeferredOp>)
                .transpose()?;
            out.push(QueuedUnknown {
                id,
                thing: UnknownThing {
                    identifier,
                    kind,
                    payload,
                },
                created_at: from_ms(created_at_ms),
            });
        }
        Ok(out)
    }

    fn resolve_unknown(&mut self, ids: &[i64]) -> StoreResult<usize> {
        let tx = self.conn.transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM unknown_thing WHERE id = ?1")?;
            for id in ids {
                count += stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(count)
    }

    fn forget_unknown(&mut self, kind: UnknownKind, identifiers: &[String]) -> StoreResult<usize> {
        let tx = self.conn.transaction()?;
        let mut count = 0;
        for chunk in identifiers.chunks(IN_CHUNK) {
            let sql = format!(
                "DELETE FROM unknown_thing WHERE kind = ?1 AND identifier IN ({})",
                numbered_placeholders(2, chunk.len())
            );
            let mut bound: Vec<rusqlite::types::Value> = vec![kind.as_str().to_string().into()];
            bound.extend(chunk.iter().map(|id| rusqlite::types::Value::Text(id.clone())));
            count += tx.execute(&sql, params_from_iter(bound.iter()))?;
        }
        tx.commit()?;
        Ok(count)
    }

    fn unknown_count(&self) -> StoreResult<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM unknown_thing", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn insert_scores(&mut self, rows: &[PostScore]) -> StoreResult<usize> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO post_score(uri, feed_name, version, score, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for row in rows {
                let res = stmt.execute(params![
                    row.uri,
                    row.feed_name,
                    row.version,
                    row.score,
                    to_ms(row.created_at),
                ]);
                match res {
                    Ok(_) => {}
                    Err(err) if is_constraint_violation(&err) => {
                        return Err(StoreError::Conflict(format!(
                            "{}::{} already holds {}",
                            row.feed_name, row.version, row.uri
                        )));
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    fn prune_scores(&mut self, created_before: OffsetDateTime) -> StoreResult<usize> {
        let count = self.conn.execute(
            "DELETE FROM post_score WHERE created_at_ms < ?1",
            params![to_ms(created_before)],
        )?;
        Ok(count)
    }

    fn latest_version(&self, feed: &str) -> StoreResult<Option<FeedVersion>> {
        let version: Option<i64> = self.conn.query_row(
            "SELECT MAX(version) FROM post_score WHERE feed_name = ?1",
            params![feed],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    fn score_page(
        &self,
        feed: &str,
        version: FeedVersion,
        offset: usize,
        limit: usize,
    ) -> StoreResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT uri FROM post_score
             WHERE feed_name = ?1 AND version = ?2
             ORDER BY score DESC LIMIT ?3 OFFSET ?4",
        )?;
        let rows = stmt.query_map(
            params![feed, version, limit as i64, offset as i64],
            |row| row.get(0),
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn numbered_placeholders(first: usize, n: usize) -> String {
    (first..first + n)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn actor_values(actor: &Actor) -> [&dyn ToSql; 15] {
    [
        &actor.did,
        &actor.handle,
        &actor.display_name,
        &actor.description,
        &actor.is_muted,
        &actor.is_external_to_network,
        &actor.manual_include_in_network,
        &actor.manual_include_in_focus,
        &actor.flagged_for_manual_review,
        &actor.autolabel_fem_vibes,
        &actor.autolabel_nb_vibes,
        &actor.autolabel_masc_vibes,
        &actor.follower_count,
        &actor.following_count,
        &actor.is_deleted,
    ]
}

fn actor_from_row(row: &Row<'_>) -> rusqlite::Result<Actor> {
    Ok(Actor {
        did: row.get(0)?,
        handle: row.get(1)?,
        display_name: row.get(2)?,
        description: row.get(3)?,
        is_muted: row.get(4)?,
        is_external_to_network: row.get(5)?,
        manual_include_in_network: row.get(6)?,
        manual_include_in_focus: row.get(7)?,
        flagged_for_manual_review: row.get(8)?,
        autolabel_fem_vibes: row.get(9)?,
        autolabel_nb_vibes: row.get(10)?,
        autolabel_masc_vibes: row.get(11)?,
        follower_count: row.get(12)?,
        following_count: row.get(13)?,
        is_deleted: row.get(14)?,
    })
}

fn post_from_row(row: &Row<'_>) -> rusqlite::Result<Post> {
    let labels: String = row.get(11)?;
    let labels = serde_json::from_str(&labels).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(11, rusqlite::types::Type::Text, Box::new(err))
    })?;
    let last_rescan: Option<i64> = row.get(15)?;
    Ok(Post {
        uri: row.get(0)?,
        cid: row.get(1)?,
        author: row.get(2)?,
        text: row.get(3)?,
        indexed_at: from_ms(row.get(4)?),
        reply_parent: row.get(5)?,
        reply_root: row.get(6)?,
        embed_uri: row.get(7)?,
        embed_cid: row.get(8)?,
        media_count: row.get(9)?,
        media_with_alt_text_count: row.get(10)?,
        labels,
        like_count: row.get(12)?,
        is_pinned: row.get(13)?,
        is_deleted: row.get(14)?,
        last_rescan: last_rescan.map(from_ms),
    })
}

fn like_from_row(row: &Row<'_>) -> rusqlite::Result<Like> {
    Ok(Like {
        uri: row.get(0)?,
        cid: row.get(1)?,
        liker: row.get(2)?,
        post_uri: row.get(3)?,
        post_cid: row.get(4)?,
        created_at: from_ms(row.get(5)?),
        attributed_feed: row.get(6)?,
    })
}

fn to_ms(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

fn from_ms(ms: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}
