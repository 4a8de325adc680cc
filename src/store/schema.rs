pub const CREATE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS verdicts (
    vulnerability_id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    patch_applied INTEGER NOT NULL,
    exploit_blocked INTEGER NOT NULL,
    functionality_preserved INTEGER,
    verdict_json TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_verdicts_status ON verdicts(status);
";
