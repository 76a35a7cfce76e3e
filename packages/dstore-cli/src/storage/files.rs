// Filesystem helpers shared by the local store, the remote cache and the
// catalog backend
use crate::error::{IoContext, StoreError, StoreResult};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Final component of a path as UTF-8.
pub fn file_name(path: &Path) -> StoreResult<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| StoreError::InvalidPath(path.display().to_string()))
}

/// Render a relative path with `/` separators regardless of platform.
pub fn slash_path(rel: &Path) -> String {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

pub async fn exists(path: &Path) -> StoreResult<bool> {
    fs::try_exists(path).await.at(path)
}

/// Sorted `(name, is_dir)` listing of a directory.
pub async fn read_dir_sorted(dir: &Path) -> StoreResult<Vec<(String, bool)>> {
    let mut reader = fs::read_dir(dir).await.at(dir)?;
    let mut children = Vec::new();
    while let Some(child) = reader.next_entry().await.at(dir)? {
        let file_type = child.file_type().await.at(&child.path())?;
        let Some(name) = child.file_name().to_str().map(str::to_string) else {
            return Err(StoreError::InvalidPath(child.path().display().to_string()));
        };
        children.push((name, file_type.is_dir()));
    }
    children.sort();
    Ok(children)
}

/// Relative paths of every regular file beneath `root`, sorted.
pub async fn walk_files(root: &Path) -> StoreResult<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![PathBuf::new()];
    while let Some(rel) = pending.pop() {
        for (name, is_dir) in read_dir_sorted(&root.join(&rel)).await? {
            if is_dir {
                pending.push(rel.join(name));
            } else {
                found.push(rel.join(name));
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Recursively copy `src` (file or directory) to `dst`.
///
/// Files are streamed one at a time, so a watcher polling `dst` sees
/// progress as each file lands. Returns the number of bytes copied.
pub async fn copy_path(src: &Path, dst: &Path) -> StoreResult<u64> {
    let meta = fs::metadata(src).await.at(src)?;
    if !meta.is_dir() {
        return copy_file(src, dst).await;
    }

    let mut copied = 0;
    fs::create_dir_all(dst).await.at(dst)?;
    for rel in walk_dirs(src).await? {
        let target = dst.join(&rel);
        fs::create_dir_all(&target).await.at(&target)?;
    }
    for rel in walk_files(src).await? {
        copied += copy_file(&src.join(&rel), &dst.join(&rel)).await?;
    }
    Ok(copied)
}

async fn copy_file(src: &Path, dst: &Path) -> StoreResult<u64> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).await.at(parent)?;
    }
    let mut reader = fs::File::open(src).await.at(src)?;
    let mut writer = fs::File::create(dst).await.at(dst)?;
    let copied = tokio::io::copy(&mut reader, &mut writer).await.at(dst)?;
    writer.flush().await.at(dst)?;
    Ok(copied)
}

async fn walk_dirs(root: &Path) -> StoreResult<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![PathBuf::new()];
    while let Some(rel) = pending.pop() {
        for (name, is_dir) in read_dir_sorted(&root.join(&rel)).await? {
            if is_dir {
                found.push(rel.join(&name));
                pending.push(rel.join(name));
            }
        }
    }
    Ok(found)
}

/// Write `data` to a temporary sibling, sync it, then rename over `path`.
pub async fn write_atomic(path: &Path, data: &[u8]) -> StoreResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::InvalidPath(path.display().to_string()))?;
    fs::create_dir_all(parent).await.at(parent)?;

    let tmp = parent.join(format!(".{}.tmp", file_name(path)?));
    let mut file = fs::File::create(&tmp).await.at(&tmp)?;
    file.write_all(data).await.at(&tmp)?;
    file.sync_all().await.at(&tmp)?;
    drop(file);

    fs::rename(&tmp, path).await.at(path)
}

/// Remove a file or directory tree; missing paths are fine.
pub async fn remove_path(path: &Path) -> StoreResult<()> {
    match fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).await.at(path),
        Ok(_) => fs::remove_file(path).await.at(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

/// Move a fully written directory over `target`.
///
/// The previous content is renamed aside first and restored if the final
/// rename fails, so `target` is never left half replaced.
pub async fn replace_dir(staged: &Path, target: &Path) -> StoreResult<()> {
    swap_dir(staged, target).await?.commit().await
}

/// Move `staged` over `target`, keeping the previous content aside until the
/// swap is committed or rolled back.
pub async fn swap_dir(staged: &Path, target: &Path) -> StoreResult<DirSwap> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await.at(parent)?;
    }
    let aside = target.with_file_name(format!(".{}.old", file_name(target)?));
    remove_path(&aside).await?;

    let had_previous = exists(target).await?;
    if had_previous {
        fs::rename(target, &aside).await.at(target)?;
    }
    if let Err(e) = fs::rename(staged, target).await {
        if had_previous {
            fs::rename(&aside, target).await.at(target)?;
        }
        return Err(StoreError::io(target, e));
    }
    Ok(DirSwap {
        target: target.to_path_buf(),
        aside: had_previous.then_some(aside),
    })
}

/// A directory swapped into place whose previous content is still kept.
#[must_use = "a swap must be committed or rolled back"]
pub struct DirSwap {
    target: PathBuf,
    aside: Option<PathBuf>,
}

impl DirSwap {
    /// Drop the previous content.
    pub async fn commit(self) -> StoreResult<()> {
        match &self.aside {
            Some(aside) => remove_path(aside).await,
            None => Ok(()),
        }
    }

    /// Put the previous content back (or remove the target if there was none).
    pub async fn rollback(self) -> StoreResult<()> {
        remove_path(&self.target).await?;
        if let Some(aside) = &self.aside {
            fs::rename(aside, &self.target).await.at(&self.target)?;
        }
        Ok(())
    }
}
