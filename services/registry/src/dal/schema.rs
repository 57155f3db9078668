use indoc::indoc;

use super::Dialect;

/// Every table, written once for both dialects. `{id}` and `{bytes}` are
/// replaced per dialect before the script is split into statements.
const SCHEMA: &str = indoc! {"
    CREATE TABLE IF NOT EXISTS namespaces (
        id {id},
        name TEXT NOT NULL UNIQUE,
        description TEXT,
        visibility TEXT NOT NULL,
        size BIGINT NOT NULL DEFAULT 0,
        size_limit BIGINT NOT NULL DEFAULT 0,
        repository_count BIGINT NOT NULL DEFAULT 0,
        repository_limit BIGINT NOT NULL DEFAULT 0,
        tag_count BIGINT NOT NULL DEFAULT 0,
        tag_limit BIGINT NOT NULL DEFAULT 0,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS repositories (
        id {id},
        namespace_id BIGINT NOT NULL REFERENCES namespaces(id) ON DELETE CASCADE,
        name TEXT NOT NULL UNIQUE,
        description TEXT,
        visibility TEXT NOT NULL,
        size BIGINT NOT NULL DEFAULT 0,
        size_limit BIGINT NOT NULL DEFAULT 0,
        tag_count BIGINT NOT NULL DEFAULT 0,
        tag_limit BIGINT NOT NULL DEFAULT 0,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_repositories_namespace ON repositories (namespace_id);

    CREATE TABLE IF NOT EXISTS blobs (
        id {id},
        digest TEXT NOT NULL UNIQUE,
        size BIGINT NOT NULL,
        content_type TEXT NOT NULL,
        pushed_at BIGINT NOT NULL,
        last_pull BIGINT NOT NULL,
        pull_times BIGINT NOT NULL DEFAULT 0,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_blobs_last_pull ON blobs (last_pull);

    CREATE TABLE IF NOT EXISTS artifacts (
        id {id},
        repository_id BIGINT NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
        digest TEXT NOT NULL,
        size BIGINT NOT NULL,
        blobs_size BIGINT NOT NULL,
        content_type TEXT NOT NULL,
        raw {bytes} NOT NULL,
        artifact_type TEXT NOT NULL,
        declared_type TEXT,
        config_media_type TEXT,
        subject_digest TEXT,
        referrer_id BIGINT REFERENCES artifacts(id) ON DELETE SET NULL,
        pushed_at BIGINT NOT NULL,
        last_pull BIGINT NOT NULL,
        pull_times BIGINT NOT NULL DEFAULT 0,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL,
        UNIQUE (repository_id, digest)
    );

    CREATE INDEX IF NOT EXISTS idx_artifacts_referrer ON artifacts (referrer_id);
    CREATE INDEX IF NOT EXISTS idx_artifacts_subject ON artifacts (repository_id, subject_digest);

    CREATE TABLE IF NOT EXISTS artifact_blobs (
        artifact_id BIGINT NOT NULL REFERENCES artifacts(id) ON DELETE CASCADE,
        blob_id BIGINT NOT NULL REFERENCES blobs(id),
        PRIMARY KEY (artifact_id, blob_id)
    );

    CREATE INDEX IF NOT EXISTS idx_artifact_blobs_blob ON artifact_blobs (blob_id);

    CREATE TABLE IF NOT EXISTS artifact_artifacts (
        parent_id BIGINT NOT NULL REFERENCES artifacts(id) ON DELETE CASCADE,
        child_id BIGINT NOT NULL REFERENCES artifacts(id) ON DELETE CASCADE,
        PRIMARY KEY (parent_id, child_id)
    );

    CREATE INDEX IF NOT EXISTS idx_artifact_artifacts_child ON artifact_artifacts (child_id);

    CREATE TABLE IF NOT EXISTS tags (
        id {id},
        repository_id BIGINT NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
        artifact_id BIGINT NOT NULL REFERENCES artifacts(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        pushed_at BIGINT NOT NULL,
        last_pull BIGINT NOT NULL,
        pull_times BIGINT NOT NULL DEFAULT 0,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL,
        UNIQUE (repository_id, name)
    );

    CREATE INDEX IF NOT EXISTS idx_tags_artifact ON tags (artifact_id);

    CREATE TABLE IF NOT EXISTS blob_uploads (
        id {id},
        upload_id TEXT NOT NULL UNIQUE,
        repository TEXT NOT NULL,
        driver_upload_id TEXT NOT NULL,
        size BIGINT NOT NULL DEFAULT 0,
        tail {bytes},
        status TEXT NOT NULL,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_blob_uploads_status ON blob_uploads (status, updated_at);

    CREATE TABLE IF NOT EXISTS blob_upload_parts (
        upload_id BIGINT NOT NULL REFERENCES blob_uploads(id) ON DELETE CASCADE,
        part_number BIGINT NOT NULL,
        etag TEXT NOT NULL,
        range_start BIGINT NOT NULL,
        range_end BIGINT NOT NULL,
        PRIMARY KEY (upload_id, part_number)
    );

    CREATE TABLE IF NOT EXISTS work_queues (
        id {id},
        topic TEXT NOT NULL,
        payload {bytes} NOT NULL,
        version TEXT NOT NULL,
        times BIGINT NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_work_queues_topic ON work_queues (topic, status, id);

    CREATE TABLE IF NOT EXISTS settings (
        name TEXT PRIMARY KEY,
        val {bytes} NOT NULL,
        updated_at BIGINT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS users (
        id {id},
        username TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        email TEXT,
        role TEXT NOT NULL,
        last_login BIGINT NOT NULL DEFAULT 0,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS webhooks (
        id {id},
        namespace_id BIGINT REFERENCES namespaces(id) ON DELETE CASCADE,
        url TEXT NOT NULL,
        secret TEXT,
        ssl_verify BIGINT NOT NULL DEFAULT 1,
        retry_times BIGINT NOT NULL DEFAULT 3,
        retry_duration BIGINT NOT NULL DEFAULT 5,
        enabled BIGINT NOT NULL DEFAULT 1,
        events TEXT NOT NULL,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS webhook_logs (
        id {id},
        webhook_id BIGINT REFERENCES webhooks(id) ON DELETE CASCADE,
        event TEXT NOT NULL,
        event_action TEXT NOT NULL,
        status_code BIGINT NOT NULL,
        req_header {bytes} NOT NULL,
        req_body {bytes} NOT NULL,
        resp_header {bytes} NOT NULL,
        resp_body {bytes} NOT NULL,
        duration_ms BIGINT NOT NULL,
        created_at BIGINT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS tag_retention_rules (
        id {id},
        namespace_id BIGINT REFERENCES namespaces(id) ON DELETE CASCADE,
        kind TEXT NOT NULL,
        amount BIGINT NOT NULL,
        pattern TEXT,
        created_at BIGINT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS gc_runners (
        id {id},
        resource TEXT NOT NULL,
        namespace_id BIGINT,
        status TEXT NOT NULL,
        operate_type TEXT NOT NULL,
        cascade_next BIGINT NOT NULL DEFAULT 0,
        message TEXT,
        started_at BIGINT,
        ended_at BIGINT,
        duration_ms BIGINT,
        success_count BIGINT NOT NULL DEFAULT 0,
        failed_count BIGINT NOT NULL DEFAULT 0,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS gc_tag_records (
        id {id},
        runner_id BIGINT NOT NULL REFERENCES gc_runners(id) ON DELETE CASCADE,
        subject TEXT NOT NULL,
        digest TEXT,
        status TEXT NOT NULL,
        message TEXT,
        created_at BIGINT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS gc_artifact_records (
        id {id},
        runner_id BIGINT NOT NULL REFERENCES gc_runners(id) ON DELETE CASCADE,
        subject TEXT NOT NULL,
        digest TEXT,
        status TEXT NOT NULL,
        message TEXT,
        created_at BIGINT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS gc_blob_records (
        id {id},
        runner_id BIGINT NOT NULL REFERENCES gc_runners(id) ON DELETE CASCADE,
        subject TEXT NOT NULL,
        digest TEXT,
        status TEXT NOT NULL,
        message TEXT,
        created_at BIGINT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS gc_repository_records (
        id {id},
        runner_id BIGINT NOT NULL REFERENCES gc_runners(id) ON DELETE CASCADE,
        subject TEXT NOT NULL,
        digest TEXT,
        status TEXT NOT NULL,
        message TEXT,
        created_at BIGINT NOT NULL
    );
"};

/// The schema as individual statements for `dialect`.
pub(super) fn statements(dialect: Dialect) -> Vec<String> {
    let (id, bytes) = match dialect {
        Dialect::Sqlite => ("INTEGER PRIMARY KEY AUTOINCREMENT", "BLOB"),
        Dialect::Postgres => ("BIGSERIAL PRIMARY KEY", "BYTEA"),
    };
    SCHEMA
        .replace("{id}", id)
        .replace("{bytes}", bytes)
        .split(';')
        .map(str::trim)
        .filter(|statement| !statement.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_replaced() {
        for dialect in [Dialect::Sqlite, Dialect::Postgres] {
            let statements = statements(dialect);
            assert!(statements.len() > 20);
            assert!(statements.iter().all(|s| !s.contains('{')));
        }
        assert!(statements(Dialect::Postgres)[0].contains("BIGSERIAL"));
    }
}
