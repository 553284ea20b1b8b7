//! Security invariant tests for the AgentPay settlement workspace.
//!
//! These scan the production sources of every crate under `crates/` and fail
//! when a change regresses a property the settlement path depends on.

use regex::Regex;
use std::path::Path;
use walkdir::WalkDir;

/// Read all .rs source files from production crates (excluding tests and this crate).
fn production_source_files() -> Vec<(String, String)> {
    let root = Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .parent()
        .unwrap();

    let crates_dir = root.join("crates");
    let mut files = Vec::new();

    for entry in WalkDir::new(&crates_dir).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();

        if path.extension().and_then(|e| e.to_str()) != Some("rs") {
            continue;
        }

        let path_str = path.to_str().unwrap_or("");
        if path_str.contains("security-audit") {
            continue;
        }
        if path_str.contains("tests/") || path_str.contains("\\tests\\") {
            continue;
        }

        if let Ok(content) = std::fs::read_to_string(path) {
            files.push((path_str.to_string(), content));
        }
    }

    files
}

/// Lines before the first `#[cfg(test)]` / `mod tests`, with comment lines
/// (including doc examples) removed.
fn production_lines(content: &str) -> String {
    let mut result = Vec::new();

    for line in content.lines() {
        if line.contains("#[cfg(test)]") || line.trim().starts_with("mod tests") {
            break;
        }
        if line.trim_start().starts_with("//") {
            continue;
        }
        result.push(line);
    }

    result.join("\n")
}

fn find_file<'a>(files: &'a [(String, String)], suffix: &str) -> &'a str {
    files
        .iter()
        .find(|(path, _)| path.replace('\\', "/").ends_with(suffix))
        .map(|(_, content)| content.as_str())
        .unwrap_or_else(|| panic!("{suffix} not found"))
}

#[test]
fn no_hardcoded_private_keys_in_production_code() {
    let hex_64_re = Regex::new(r"0x[a-fA-F0-9]{64}").unwrap();
    let files = production_source_files();

    for (path, content) in &files {
        let prod_content = production_lines(content);

        if let Some(mat) = hex_64_re.find(&prod_content) {
            let line_num = prod_content[..mat.start()].lines().count() + 1;
            panic!(
                "Potential hardcoded secret found at {}:{}: {}",
                path,
                line_num,
                mat.as_str()
            );
        }
    }
}

#[test]
fn no_unwrap_in_production_code() {
    let unwrap_re = Regex::new(r"\.(unwrap|expect)\(").unwrap();
    let files = production_source_files();

    for (path, content) in &files {
        // Prometheus registration in LazyLock statics may only fail on a
        // duplicate metric name, which is a programming error.
        if path.ends_with("metrics.rs") {
            continue;
        }

        let prod_content = production_lines(content);
        for (i, line) in prod_content.lines().enumerate() {
            assert!(
                !unwrap_re.is_match(line),
                "unwrap/expect in production code at {}:{}: {}. Propagate the error instead.",
                path,
                i + 1,
                line.trim()
            );
        }
    }
}

#[test]
fn metrics_token_compared_in_constant_time() {
    let files = production_source_files();
    let routes = production_lines(find_file(&files, "agentpay-gateway/src/routes.rs"));

    assert!(
        routes.contains("ct_eq"),
        "/metrics bearer token must be compared with subtle::ConstantTimeEq"
    );
    assert!(
        !Regex::new(r"token\s*==|==\s*expected").unwrap().is_match(&routes),
        "/metrics bearer token must not be compared with =="
    );
}

#[test]
fn cors_never_allows_any_origin() {
    let files = production_source_files();

    for (path, content) in &files {
        let prod_content = production_lines(content);
        assert!(
            !prod_content.contains("allow_any_origin") && !prod_content.contains("Cors::permissive"),
            "CORS at {} allows any origin. Payment endpoints must use an explicit allow-list.",
            path
        );
    }
}

#[test]
fn sqlite_ledger_is_owner_only() {
    let files = production_source_files();
    let ledger = production_lines(find_file(&files, "agentpay/src/sqlite_ledger.rs"));

    assert!(
        ledger.contains("0o600"),
        "SQLite ledger file must be restricted to mode 0600"
    );
}

#[test]
fn nonce_table_enforces_uniqueness() {
    let files = production_source_files();
    let ledger = production_lines(find_file(&files, "agentpay/src/sqlite_ledger.rs"));

    assert!(
        ledger.contains("PRIMARY KEY (payer, nonce)"),
        "consumed_nonces must key on (payer, nonce) so a replay fails inside the transaction"
    );
    assert!(
        ledger.contains("TransactionBehavior::Immediate"),
        "settlement commits must take the write lock up front"
    );
}

#[test]
fn gateway_does_not_hardwire_in_memory_ledger() {
    let files = production_source_files();
    let main = production_lines(find_file(&files, "agentpay-gateway/src/main.rs"));

    assert!(
        !main.contains("InMemoryLedger"),
        "Gateway binary must pick its ledger from configuration; the in-memory ledger \
         forgets consumed nonces on restart."
    );
}

#[test]
fn error_responses_do_not_leak_internals() {
    let files = production_source_files();

    let dangerous_patterns = [
        "ledger unreachable",
        "database error:",
        "stack trace",
        "RUST_BACKTRACE",
    ];

    for (path, content) in &files {
        if !content.contains("HttpResponse::") {
            continue;
        }

        let prod_content = production_lines(content);

        for pattern in &dangerous_patterns {
            for (i, line) in prod_content.lines().enumerate() {
                if line.contains(pattern) && line.contains("json") {
                    panic!(
                        "Potentially sensitive error detail '{}' found in HTTP response at {}:{}. \
                         Internal details should be logged server-side only.",
                        pattern,
                        path,
                        i + 1
                    );
                }
            }
        }
    }
}
