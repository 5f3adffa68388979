//! The vault: a folder of markdown notes.
//!
//! All note I/O goes through [`Vault`], which enumerates markdown files
//! with include/exclude globs and resolves vault-relative paths, refusing
//! any path that would escape the vault root.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::config::VaultConfig;

/// A markdown file found in the vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteFile {
    /// Vault-relative path with `/` separators.
    pub path: String,
    pub abs_path: PathBuf,
}

impl NoteFile {
    /// File name without the `.md` extension.
    pub fn basename(&self) -> &str {
        let name = self.path.rsplit('/').next().unwrap_or(&self.path);
        name.strip_suffix(".md").unwrap_or(name)
    }
}

pub struct Vault {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    follow_symlinks: bool,
}

impl Vault {
    pub fn open(config: &VaultConfig) -> Result<Self> {
        let root = config.root.clone();
        if !root.is_dir() {
            bail!("Vault root does not exist: {}", root.display());
        }

        let include = build_globset(&config.include_globs)?;

        let mut excludes = vec![
            "**/.obsidian/**".to_string(),
            "**/.git/**".to_string(),
            "**/.trash/**".to_string(),
        ];
        excludes.extend(config.exclude_globs.clone());
        let exclude = build_globset(&excludes)?;

        Ok(Self {
            root,
            include,
            exclude,
            follow_symlinks: config.follow_symlinks,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// True when a vault-relative path is an indexable note.
    pub fn is_note_path(&self, rel: &str) -> bool {
        rel.ends_with(".md") && self.include.is_match(rel) && !self.exclude.is_match(rel)
    }

    /// All indexable markdown files, sorted by path.
    pub fn markdown_files(&self) -> Result<Vec<NoteFile>> {
        let mut files = Vec::new();

        let walker = WalkDir::new(&self.root).follow_links(self.follow_symlinks);
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let abs = entry.path();
            let rel = match self.relative(abs) {
                Some(rel) => rel,
                None => continue,
            };
            if !self.is_note_path(&rel) {
                continue;
            }

            files.push(NoteFile {
                path: rel,
                abs_path: abs.to_path_buf(),
            });
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    /// Vault-relative `/`-separated form of an absolute path inside the root.
    pub fn relative(&self, abs: &Path) -> Option<String> {
        let rel = abs.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        if parts.is_empty() {
            return None;
        }
        Some(parts.join("/"))
    }

    /// Absolute path for a vault-relative one.
    pub fn resolve(&self, rel: &str) -> Result<PathBuf> {
        let rel_path = Path::new(rel);
        if rel.trim().is_empty() {
            bail!("empty vault path");
        }
        for component in rel_path.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => bail!("invalid vault path: {}", rel),
            }
        }
        Ok(self.root.join(rel_path))
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.resolve(rel).map(|p| p.is_file()).unwrap_or(false)
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        let path = self.resolve(rel)?;
        std::fs::read_to_string(&path).with_context(|| format!("Failed to read note: {}", rel))
    }

    /// Write a note, creating parent folders.
    pub fn write(&self, rel: &str, content: &str) -> Result<()> {
        let path = self.resolve(rel)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content).with_context(|| format!("Failed to write note: {}", rel))
    }

    /// Append to a note, creating it if missing.
    pub fn append(&self, rel: &str, content: &str) -> Result<()> {
        let path = self.resolve(rel)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open note for append: {}", rel))?;
        file.write_all(content.as_bytes())?;
        Ok(())
    }

    /// Write `initial` only if the note does not exist yet.
    pub fn create_if_missing(&self, rel: &str, initial: &str) -> Result<bool> {
        if self.exists(rel) {
            return Ok(false);
        }
        self.write(rel, initial)?;
        Ok(true)
    }

    /// Basenames of the markdown files directly inside a folder.
    pub fn list_folder(&self, folder: &str) -> Result<Vec<String>> {
        let dir = self.resolve(folder)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(stem) = name.strip_suffix(".md") {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Resolve a wikilink target (`Name` or `Name|alias`) by basename.
    pub fn find_by_basename(&self, link: &str) -> Result<Option<NoteFile>> {
        let target = link.split('|').next().unwrap_or(link).trim();
        let target = target.strip_suffix(".md").unwrap_or(target);
        if target.is_empty() {
            return Ok(None);
        }

        let files = self.markdown_files()?;
        if target.contains('/') {
            let wanted = format!("{}.md", target);
            return Ok(files.into_iter().find(|f| f.path == wanted));
        }
        Ok(files.into_iter().find(|f| f.basename() == target))
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
