//! User firmware images on disk, laid out as `<root>/<user>/<nodetype>/<image>`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("Invalid name: {0}")]
    InvalidName(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Images a user uploaded for one node type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeTypeImages {
    pub nodetype_id: String,
    pub images: Vec<String>,
}

/// Reject anything that could escape its directory.
/// Whether `name` can be joined as a single path component.
pub(crate) fn is_plain_component(name: &str) -> bool {
    !(name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']))
}

fn checked(name: &str) -> Result<&str, ImageError> {
    if !is_plain_component(name) {
        return Err(ImageError::InvalidName(name.to_string()));
    }
    Ok(name)
}

fn sorted_entries(dir: &Path, want_dirs: bool) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() == want_dirs {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self, user: &str, nodetype_id: &str, name: &str) -> Result<PathBuf, ImageError> {
        Ok(self
            .root
            .join(checked(user)?)
            .join(checked(nodetype_id)?)
            .join(checked(name)?))
    }

    /// Images grouped by node type; empty when the user has none.
    pub fn list(&self, user: &str) -> Result<Vec<NodeTypeImages>, ImageError> {
        let user_dir = self.root.join(checked(user)?);
        if !user_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut listing = Vec::new();
        for nodetype_id in sorted_entries(&user_dir, true)? {
            let images = sorted_entries(&user_dir.join(&nodetype_id), false)?;
            listing.push(NodeTypeImages {
                nodetype_id,
                images,
            });
        }
        Ok(listing)
    }

    pub fn save(
        &self,
        user: &str,
        nodetype_id: &str,
        name: &str,
        data: &str,
    ) -> Result<PathBuf, ImageError> {
        let path = self.path(user, nodetype_id, name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, data)?;
        tracing::info!(user = %user, nodetype = %nodetype_id, image = %name, "Saved image");
        Ok(path)
    }

    /// Node type directory holding `name`, if the user uploaded it.
    pub fn find_nodetype(&self, user: &str, name: &str) -> Result<Option<String>, ImageError> {
        let user_dir = self.root.join(checked(user)?);
        let name = checked(name)?;
        if !user_dir.is_dir() {
            return Ok(None);
        }
        for nodetype_id in sorted_entries(&user_dir, true)? {
            if user_dir.join(&nodetype_id).join(name).is_file() {
                return Ok(Some(nodetype_id));
            }
        }
        Ok(None)
    }

    /// Delete an image and prune directories it leaves empty. `false` when absent.
    pub fn delete(&self, user: &str, name: &str) -> Result<bool, ImageError> {
        let Some(nodetype_id) = self.find_nodetype(user, name)? else {
            return Ok(false);
        };
        let path = self.path(user, &nodetype_id, name)?;
        fs::remove_file(&path)?;

        let nodetype_dir = self.root.join(user).join(&nodetype_id);
        remove_if_empty(&nodetype_dir)?;
        remove_if_empty(&self.root.join(user))?;
        tracing::info!(user = %user, image = %name, "Deleted image");
        Ok(true)
    }
}

fn remove_if_empty(dir: &Path) -> io::Result<()> {
    if fs::read_dir(dir)?.next().is_none() {
        fs::remove_dir(dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_list_and_find() {
        let dir = tempfile::tempdir().unwrap();
        let images = ImageStore::new(dir.path());

        images.save("ada", "UNO", "blink.hex", ":00000001FF").unwrap();
        images.save("ada", "UNO", "adc.hex", ":00").unwrap();
        images.save("ada", "TELOSB", "radio.ihex", ":00").unwrap();

        let listing = images.list("ada").unwrap();
        assert_eq!(
            listing,
            vec![
                NodeTypeImages {
                    nodetype_id: "TELOSB".to_string(),
                    images: vec!["radio.ihex".to_string()],
                },
                NodeTypeImages {
                    nodetype_id: "UNO".to_string(),
                    images: vec!["adc.hex".to_string(), "blink.hex".to_string()],
                },
            ]
        );
        assert_eq!(
            images.find_nodetype("ada", "blink.hex").unwrap().as_deref(),
            Some("UNO")
        );
        assert_eq!(images.find_nodetype("bob", "blink.hex").unwrap(), None);
    }

    #[test]
    fn test_list_for_unknown_user_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ImageStore::new(dir.path()).list("nobody").unwrap().is_empty());
    }

    #[test]
    fn test_delete_prunes_empty_directories() {
        let dir = tempfile::tempdir().unwrap();
        let images = ImageStore::new(dir.path());
        images.save("ada", "UNO", "blink.hex", "x").unwrap();

        assert!(images.delete("ada", "blink.hex").unwrap());
        assert!(!dir.path().join("ada").exists());
        assert!(!images.delete("ada", "blink.hex").unwrap());
    }

    #[test]
    fn test_delete_keeps_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let images = ImageStore::new(dir.path());
        images.save("ada", "UNO", "a.hex", "x").unwrap();
        images.save("ada", "UNO", "b.hex", "x").unwrap();

        assert!(images.delete("ada", "a.hex").unwrap());
        assert!(dir.path().join("ada/UNO/b.hex").exists());
    }

    #[test]
    fn test_path_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let images = ImageStore::new(dir.path());
        assert!(matches!(
            images.save("ada", "..", "x.hex", "x"),
            Err(ImageError::InvalidName(_))
        ));
        assert!(matches!(
            images.save("ada", "UNO", "../../etc/passwd", "x"),
            Err(ImageError::InvalidName(_))
        ));
    }
}
