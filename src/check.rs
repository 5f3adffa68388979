//! `vf check`: report which parts of the configuration are usable.

use anyhow::Result;

use crate::config::Config;
use crate::index::load_index;
use crate::vault::Vault;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckItem {
    pub name: &'static str,
    pub status: String,
    pub healthy: bool,
}

fn item(name: &'static str, status: impl Into<String>, healthy: bool) -> CheckItem {
    CheckItem {
        name,
        status: status.into(),
        healthy,
    }
}

pub fn check_setup(config: &Config) -> Vec<CheckItem> {
    let mut items = Vec::new();

    let vault = Vault::open(&config.vault);
    items.push(match &vault {
        Ok(v) => match v.markdown_files() {
            Ok(files) => item("vault", format!("OK ({} notes)", files.len()), true),
            Err(e) => item("vault", format!("UNREADABLE ({})", e), false),
        },
        Err(_) => item("vault", "MISSING ROOT", false),
    });

    items.push(match load_index(&config.index.path) {
        Some(snap) => item(
            "index",
            format!("OK ({} entries, {})", snap.entries.len(), snap.model),
            true,
        ),
        None => item("index", "NOT BUILT", false),
    });

    items.push(match config.openai.resolve_api_key() {
        Some(_) => item("openai", "OK", true),
        None => item("openai", "NO API KEY", false),
    });

    items.push(if config.rules.data_path.is_dir() {
        item("rules", "OK", true)
    } else {
        item("rules", "NO DATA", false)
    });

    items.push(match &vault {
        Ok(v) if v.resolve(&config.server.players_path).map(|p| p.is_dir()).unwrap_or(false) => {
            item("players", "OK", true)
        }
        _ => item("players", "NO FOLDER", false),
    });

    items
}

pub fn run_check(config: &Config) -> Result<()> {
    println!("{:<10} {:<32} HEALTHY", "PART", "STATUS");
    for it in check_setup(config) {
        println!("{:<10} {:<32} {}", it.name, it.status, it.healthy);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_check_fresh_vault() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.md"), "# A\n").unwrap();
        std::fs::create_dir_all(tmp.path().join("Players")).unwrap();

        let mut config = Config::default();
        config.vault.root = tmp.path().to_path_buf();
        config.index.path = tmp.path().join("missing.json");
        config.rules.data_path = tmp.path().join("no-rules");
        config.openai.api_key = Some("sk-test".into());

        let items = check_setup(&config);
        let status = |name: &str| items.iter().find(|i| i.name == name).unwrap().clone();
        assert_eq!(status("vault").status, "OK (1 notes)");
        assert!(!status("index").healthy);
        assert!(status("openai").healthy);
        assert!(!status("rules").healthy);
        assert!(status("players").healthy);
    }
}
