// src/db.rs
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use tracing::info;

use crate::config::Config;

/// Channel the change triggers notify on.
pub const CHANGE_CHANNEL: &str = "live_poll_changes";

/// Idempotent schema bootstrap.
///
/// `poll_options.votes` is a cache kept by `live_poll_count_votes`; tallies
/// are computed from `votes` rows. Every write to `votes` or `poll_options`
/// sends a JSON change event on [`CHANGE_CHANNEL`]. Row images never carry
/// the counter, and drop `option_text`/`user_id` when they would get large.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS polls (
    id          UUID PRIMARY KEY,
    title       TEXT NOT NULL CHECK (length(btrim(title)) > 0),
    user_id     TEXT NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS poll_options (
    id           UUID PRIMARY KEY,
    poll_id      UUID NOT NULL REFERENCES polls (id) ON DELETE CASCADE,
    option_text  TEXT NOT NULL,
    votes        INTEGER NOT NULL DEFAULT 0,
    created_at   TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS votes (
    id          UUID PRIMARY KEY,
    poll_id     UUID NOT NULL REFERENCES polls (id) ON DELETE CASCADE,
    option_id   UUID NOT NULL REFERENCES poll_options (id) ON DELETE CASCADE,
    user_id     TEXT NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    CONSTRAINT votes_one_per_user UNIQUE (poll_id, user_id)
);

CREATE INDEX IF NOT EXISTS poll_options_poll_id_idx ON poll_options (poll_id);
CREATE INDEX IF NOT EXISTS polls_user_id_idx ON polls (user_id, created_at DESC);

CREATE OR REPLACE FUNCTION live_poll_count_votes() RETURNS trigger AS $$
BEGIN
    IF TG_OP IN ('UPDATE', 'DELETE') THEN
        UPDATE poll_options SET votes = votes - 1 WHERE id = OLD.option_id;
    END IF;
    IF TG_OP IN ('INSERT', 'UPDATE') THEN
        UPDATE poll_options SET votes = votes + 1 WHERE id = NEW.option_id;
    END IF;
    RETURN NULL;
END;
$$ LANGUAGE plpgsql;

DROP TRIGGER IF EXISTS live_poll_count_votes ON votes;
CREATE TRIGGER live_poll_count_votes
    AFTER INSERT OR DELETE OR UPDATE OF option_id ON votes
    FOR EACH ROW EXECUTE FUNCTION live_poll_count_votes();

-- NOTIFY payloads are capped at 8000 bytes. Row images above 2000 bytes lose
-- their free-text columns; listeners resync when they need them.
CREATE OR REPLACE FUNCTION live_poll_row_image(row_data JSONB) RETURNS JSONB AS $$
DECLARE
    image JSONB := row_data - 'votes';
BEGIN
    IF octet_length(image::text) > 2000 THEN
        image := image - 'option_text' - 'user_id';
    END IF;
    RETURN image;
END;
$$ LANGUAGE plpgsql IMMUTABLE;

CREATE OR REPLACE FUNCTION live_poll_notify_change() RETURNS trigger AS $$
DECLARE
    payload JSONB;
    changed_poll UUID;
BEGIN
    IF TG_OP = 'DELETE' THEN
        changed_poll := OLD.poll_id;
    ELSE
        changed_poll := NEW.poll_id;
    END IF;
    payload := jsonb_build_object(
        'type', lower(TG_OP),
        'table', TG_TABLE_NAME,
        'poll_id', changed_poll
    );
    IF TG_OP IN ('INSERT', 'UPDATE') THEN
        payload := payload || jsonb_build_object('new_row', live_poll_row_image(to_jsonb(NEW)));
    END IF;
    IF TG_OP IN ('UPDATE', 'DELETE') THEN
        payload := payload || jsonb_build_object('old_row', live_poll_row_image(to_jsonb(OLD)));
    END IF;
    PERFORM pg_notify('live_poll_changes', payload::text);
    RETURN NULL;
END;
$$ LANGUAGE plpgsql;

DROP TRIGGER IF EXISTS live_poll_notify_votes ON votes;
CREATE TRIGGER live_poll_notify_votes
    AFTER INSERT OR UPDATE OR DELETE ON votes
    FOR EACH ROW EXECUTE FUNCTION live_poll_notify_change();

DROP TRIGGER IF EXISTS live_poll_notify_options ON poll_options;
CREATE TRIGGER live_poll_notify_options
    AFTER INSERT OR UPDATE OR DELETE ON poll_options
    FOR EACH ROW EXECUTE FUNCTION live_poll_notify_change();
"#;

pub async fn create_pool(config: &Config, database_url: &str) -> Result<Pool<Postgres>, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(database_url)
        .await
}

pub async fn migrate(pool: &Pool<Postgres>) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    info!("Database schema ready");
    Ok(())
}
