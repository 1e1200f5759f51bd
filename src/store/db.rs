//! The relational conversation index: one row per saved conversation,
//! with disambiguating lookup by id prefix or exact title.

use chrono::NaiveDateTime;
use rusqlite::{params, Connection, Row};
use thiserror::Error;

use crate::sha::{SHA1_MIN_LEN, SHA1_SHORT};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("no conversations found: {0}")]
    NoMatches(String),

    #[error("multiple conversations matched the input: {0}")]
    ManyMatches(String),

    #[error("{context}: {source}")]
    Sqlite {
        context: &'static str,
        #[source]
        source: rusqlite::Error,
    },
}

fn wrap(context: &'static str) -> impl Fn(rusqlite::Error) -> DbError {
    move |source| DbError::Sqlite { context, source }
}

/// A saved conversation row.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub updated_at: NaiveDateTime,
    pub api: Option<String>,
    pub model: Option<String>,
}

pub struct ConvoDb {
    conn: Connection,
}

impl ConvoDb {
    /// Opens (or creates) the index and applies the forward-only,
    /// idempotent migrations: base table, indexes, then the later `model`
    /// and `api` columns.
    pub fn open(path: &str) -> Result<Self, DbError> {
        let conn = Connection::open(path).map_err(wrap("could not open database"))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS conversations (
                id string NOT NULL PRIMARY KEY,
                title string NOT NULL,
                updated_at datetime NOT NULL
                    DEFAULT (strftime ('%Y-%m-%d %H:%M:%f', 'now')),
                CHECK (id <> ''),
                CHECK (title <> '')
             );
             CREATE INDEX IF NOT EXISTS idx_conv_id ON conversations (id);
             CREATE INDEX IF NOT EXISTS idx_conv_title ON conversations (title);",
        )
        .map_err(wrap("could not migrate database"))?;

        let db = Self { conn };
        for column in ["model", "api"] {
            if !db.has_column(column)? {
                db.conn
                    .execute(
                        &format!("ALTER TABLE conversations ADD COLUMN {column} string"),
                        [],
                    )
                    .map_err(wrap("could not migrate database"))?;
            }
        }
        Ok(db)
    }

    fn has_column(&self, column: &str) -> Result<bool, DbError> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT count(*) FROM pragma_table_info('conversations') WHERE name = ?1",
                params![column],
                |row| row.get(0),
            )
            .map_err(wrap("could not migrate database"))?;
        Ok(count > 0)
    }

    /// UPDATE-then-INSERT upsert. Updates bump `updated_at`.
    pub fn save(&self, id: &str, title: &str, api: &str, model: &str) -> Result<(), DbError> {
        let api = (!api.is_empty()).then_some(api);
        let model = (!model.is_empty()).then_some(model);
        let rows = self
            .conn
            .execute(
                "UPDATE conversations
                 SET title = ?1, api = ?2, model = ?3, updated_at = CURRENT_TIMESTAMP
                 WHERE id = ?4",
                params![title, api, model, id],
            )
            .map_err(wrap("could not save conversation"))?;
        if rows > 0 {
            return Ok(());
        }
        self.conn
            .execute(
                "INSERT INTO conversations (id, title, api, model) VALUES (?1, ?2, ?3, ?4)",
                params![id, title, api, model],
            )
            .map_err(wrap("could not save conversation"))?;
        Ok(())
    }

    /// Unconditional delete; matching zero rows is success.
    pub fn delete(&self, id: &str) -> Result<(), DbError> {
        self.conn
            .execute("DELETE FROM conversations WHERE id = ?1", params![id])
            .map_err(wrap("could not delete conversation"))?;
        Ok(())
    }

    /// The row with the greatest `updated_at`.
    pub fn find_head(&self) -> Result<Conversation, DbError> {
        let mut rows = self.select(
            "SELECT id, title, updated_at, api, model FROM conversations
             ORDER BY updated_at DESC LIMIT 1",
            params![],
            "could not find latest conversation",
        )?;
        rows.pop().ok_or_else(|| DbError::NoMatches("HEAD".into()))
    }

    /// Disambiguating lookup. Input shorter than the id-prefix minimum is
    /// matched against titles only; otherwise against id prefixes and
    /// exact titles.
    pub fn find(&self, input: &str) -> Result<Conversation, DbError> {
        let mut rows = if input.len() < SHA1_MIN_LEN {
            self.select(
                "SELECT id, title, updated_at, api, model FROM conversations
                 WHERE title = ?1",
                params![input],
                "could not find conversation by title",
            )?
        } else {
            self.select(
                "SELECT id, title, updated_at, api, model FROM conversations
                 WHERE id GLOB ?1 OR title = ?2",
                params![format!("{input}*"), input],
                "could not find conversation by id or title",
            )?
        };
        match rows.len() {
            0 => Err(DbError::NoMatches(input.to_string())),
            1 => Ok(rows.pop().expect("one row")),
            _ => Err(DbError::ManyMatches(input.to_string())),
        }
    }

    /// All rows, newest first.
    pub fn list(&self) -> Result<Vec<Conversation>, DbError> {
        self.select(
            "SELECT id, title, updated_at, api, model FROM conversations
             ORDER BY updated_at DESC",
            params![],
            "could not list conversations",
        )
    }

    /// Rows last updated before `now - age`.
    pub fn list_older_than(&self, age: std::time::Duration) -> Result<Vec<Conversation>, DbError> {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero());
        self.select(
            "SELECT id, title, updated_at, api, model FROM conversations
             WHERE updated_at < ?1",
            params![cutoff.format("%Y-%m-%d %H:%M:%S%.3f").to_string()],
            "could not list old conversations",
        )
    }

    /// TAB-delimited completion candidates for shell integration: short or
    /// full id paired with the title for id-prefix matches, and the title
    /// paired with the short id for title matches.
    pub fn completions(&self, input: &str) -> Result<Vec<String>, DbError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT printf (
                    '%s%c%s',
                    CASE WHEN length (?1) < ?2 THEN substr (id, 1, ?2) ELSE id END,
                    char(9),
                    title
                 )
                 FROM conversations WHERE id GLOB ?3
                 UNION
                 SELECT printf ('%s%c%s', title, char(9), substr (id, 1, ?2))
                 FROM conversations WHERE title GLOB ?3",
            )
            .map_err(wrap("could not build completions"))?;
        let rows = stmt
            .query_map(
                params![input, SHA1_SHORT as i64, format!("{input}*")],
                |row| row.get::<_, String>(0),
            )
            .map_err(wrap("could not build completions"))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(wrap("could not build completions"))
    }

    fn select(
        &self,
        sql: &str,
        args: impl rusqlite::Params,
        context: &'static str,
    ) -> Result<Vec<Conversation>, DbError> {
        let mut stmt = self.conn.prepare(sql).map_err(wrap(context))?;
        let rows = stmt
            .query_map(args, conversation_from_row)
            .map_err(wrap(context))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(wrap(context))
    }
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    let updated_at: String = row.get(2)?;
    Ok(Conversation {
        id: row.get(0)?,
        title: row.get(1)?,
        updated_at: parse_timestamp(&updated_at),
        api: row.get(3)?,
        model: row.get(4)?,
    })
}

// Rows written by the column default carry milliseconds; rows touched by
// CURRENT_TIMESTAMP updates do not.
fn parse_timestamp(text: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S"))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::thread::sleep;
    use std::time::Duration;

    use super::*;
    use crate::sha::new_conversation_id;

    const TEST_ID: &str = "df31ae23ab8b75b5643c2f846c570997edc71333";

    fn test_db() -> ConvoDb {
        ConvoDb::open(":memory:").expect("open in-memory db")
    }

    #[test]
    fn empty_list() {
        let db = test_db();
        assert!(db.list().unwrap().is_empty());
    }

    #[test]
    fn save_and_find_by_prefix() {
        let db = test_db();
        db.save(TEST_ID, "message 1", "openai", "gpt-4o").unwrap();

        let convo = db.find("df31").unwrap();
        assert_eq!(convo.id, TEST_ID);
        assert_eq!(convo.title, "message 1");
        assert_eq!(convo.api.as_deref(), Some("openai"));
        assert_eq!(convo.model.as_deref(), Some("gpt-4o"));
        assert_eq!(db.list().unwrap().len(), 1);
    }

    #[test]
    fn save_without_id_fails() {
        let db = test_db();
        assert!(db.save("", "message 1", "openai", "gpt-4o").is_err());
    }

    #[test]
    fn save_without_title_fails() {
        let db = test_db();
        assert!(db
            .save(&new_conversation_id(), "", "openai", "gpt-4o")
            .is_err());
    }

    #[test]
    fn save_twice_updates_in_place() {
        let db = test_db();
        db.save(TEST_ID, "message 1", "openai", "gpt-4o").unwrap();
        db.save(TEST_ID, "message 2", "openai", "gpt-4o").unwrap();

        let convo = db.find("df31").unwrap();
        assert_eq!(convo.title, "message 2");
        assert_eq!(db.list().unwrap().len(), 1);
    }

    #[test]
    fn head_is_most_recently_updated() {
        let db = test_db();
        db.save(TEST_ID, "message 2", "openai", "gpt-4o").unwrap();
        sleep(Duration::from_millis(100));
        let next = new_conversation_id();
        db.save(&next, "another message", "openai", "gpt-4o")
            .unwrap();

        let head = db.find_head().unwrap();
        assert_eq!(head.id, next);
        assert_eq!(head.title, "another message");
        assert_eq!(db.list().unwrap().len(), 2);
    }

    #[test]
    fn find_by_exact_title() {
        let db = test_db();
        db.save(&new_conversation_id(), "message 1", "openai", "gpt-4o")
            .unwrap();
        db.save(TEST_ID, "message 2", "openai", "gpt-4o").unwrap();

        let convo = db.find("message 2").unwrap();
        assert_eq!(convo.id, TEST_ID);
    }

    #[test]
    fn find_without_match() {
        let db = test_db();
        db.save(TEST_ID, "message 1", "openai", "gpt-4o").unwrap();
        assert!(matches!(db.find("message"), Err(DbError::NoMatches(_))));
    }

    #[test]
    fn find_with_many_matches() {
        let db = test_db();
        const TEST_ID2: &str = "df31ae23ab9b75b5641c2f846c571000edc71315";
        db.save(TEST_ID, "message 1", "openai", "gpt-4o").unwrap();
        db.save(TEST_ID2, "message 2", "openai", "gpt-4o").unwrap();
        assert!(matches!(db.find("df31ae"), Err(DbError::ManyMatches(_))));
    }

    #[test]
    fn short_input_matches_titles_only() {
        let db = test_db();
        db.save(TEST_ID, "df3", "openai", "gpt-4o").unwrap();
        // Three characters: title lookup only, never id prefix.
        let convo = db.find("df3").unwrap();
        assert_eq!(convo.title, "df3");
        db.delete(TEST_ID).unwrap();
        db.save(TEST_ID, "something else", "openai", "gpt-4o")
            .unwrap();
        assert!(matches!(db.find("df3"), Err(DbError::NoMatches(_))));
    }

    #[test]
    fn delete_is_lenient_and_total() {
        let db = test_db();
        db.save(TEST_ID, "message 1", "openai", "gpt-4o").unwrap();
        db.delete(&new_conversation_id()).unwrap();
        assert!(!db.list().unwrap().is_empty());

        for convo in db.list().unwrap() {
            db.delete(&convo.id).unwrap();
        }
        assert!(db.list().unwrap().is_empty());
        assert!(matches!(db.find(TEST_ID), Err(DbError::NoMatches(_))));
    }

    #[test]
    fn list_older_than_filters_by_age() {
        let db = test_db();
        db.save(TEST_ID, "message 1", "openai", "gpt-4o").unwrap();
        assert!(db.list_older_than(Duration::from_secs(3600)).unwrap().is_empty());
        sleep(Duration::from_millis(150));
        let old = db.list_older_than(Duration::from_millis(10)).unwrap();
        assert_eq!(old.len(), 1);
    }

    #[test]
    fn completions_pair_ids_and_titles() {
        let db = test_db();
        const ID1: &str = "fc5012d8c67073ea0a46a3c05488a0e1d87df74b";
        const TITLE1: &str = "some title";
        const ID2: &str = "6c33f71694bf41a18c844a96d1f62f153e5f6f44";
        const TITLE2: &str = "football team";
        db.save(ID1, TITLE1, "openai", "gpt-4o").unwrap();
        db.save(ID2, TITLE2, "openai", "gpt-4o").unwrap();

        let results = db.completions("f").unwrap();
        assert_eq!(
            results,
            vec![
                format!("{}\t{}", &ID1[..SHA1_SHORT], TITLE1),
                format!("{}\t{}", TITLE2, &ID2[..SHA1_SHORT]),
            ]
        );

        let results = db.completions(&ID1[..8]).unwrap();
        assert_eq!(results, vec![format!("{}\t{}", ID1, TITLE1)]);
    }
}
