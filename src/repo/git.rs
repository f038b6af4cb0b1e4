//! Git-backed repository store.
//!
//! One bare-rooted directory per project under the configured root, with a
//! normal working tree and `.git` directory. Archives are gzipped tarballs
//! of the whole project directory, staged through a scratch file so cold
//! storage uploads can stream without holding the archive in memory.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use git2::{IndexAddOption, Repository, Signature, Time};
use uuid::Uuid;

use super::{ProjectArchive, RepoError, RepoStore};
use crate::data::{CommitAuthor, RawDirectory, RawFile};
use crate::project::ProjectName;

/// Top-level entry reserved for bridge-internal scratch data.
const INTERNAL_DIR: &str = ".bridge";

pub struct GitRepoStore {
    root: PathBuf,
}

impl GitRepoStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, RepoError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        fs::create_dir_all(root.join(INTERNAL_DIR).join("staging"))?;
        fs::create_dir_all(root.join(INTERNAL_DIR).join("tmp"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn project_dir(&self, project: &ProjectName) -> PathBuf {
        self.root.join(project.as_str())
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join(INTERNAL_DIR).join("tmp")
    }

    fn open(&self, project: &ProjectName) -> Result<Repository, RepoError> {
        let dir = self.project_dir(project);
        if !dir.is_dir() {
            return Err(RepoError::Missing {
                project: project.clone(),
            });
        }
        Ok(Repository::open(dir)?)
    }

    fn walk_tree(
        &self,
        project: &ProjectName,
        dir: &Path,
        prefix: &str,
        files: &mut Vec<RawFile>,
    ) -> Result<(), RepoError> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let os_name = entry.file_name();
            let Some(name) = os_name.to_str() else {
                return Err(RepoError::NonUtf8Path { path: entry.path() });
            };
            if name == ".git" {
                if prefix.is_empty() {
                    continue;
                }
                // A nested repository would corrupt commits and archives.
                return Err(RepoError::EmbeddedRepository {
                    project: project.clone(),
                    path: format!("{prefix}{name}"),
                });
            }
            let rel = format!("{prefix}{name}");
            if file_type.is_dir() {
                self.walk_tree(project, &entry.path(), &format!("{rel}/"), files)?;
            } else if file_type.is_file() {
                let contents = fs::read(entry.path())?;
                files.push(RawFile::new(rel, contents));
            }
        }
        Ok(())
    }
}

impl RepoStore for GitRepoStore {
    fn init(&self, project: &ProjectName) -> Result<(), RepoError> {
        let dir = self.project_dir(project);
        if dir.exists() {
            return Err(RepoError::AlreadyExists {
                project: project.clone(),
            });
        }
        Repository::init(&dir)?;
        Ok(())
    }

    fn exists(&self, project: &ProjectName) -> bool {
        self.project_dir(project).is_dir()
    }

    fn directory(&self, project: &ProjectName) -> Result<RawDirectory, RepoError> {
        let dir = self.project_dir(project);
        if !dir.is_dir() {
            return Err(RepoError::Missing {
                project: project.clone(),
            });
        }
        let mut files = Vec::new();
        self.walk_tree(project, &dir, "", &mut files)?;
        Ok(RawDirectory::from_files(files))
    }

    fn commit(
        &self,
        project: &ProjectName,
        files: &[RawFile],
        author: &CommitAuthor,
        timestamp_millis: i64,
        message: &str,
    ) -> Result<Vec<String>, RepoError> {
        let repo = self.open(project)?;
        let dir = self.project_dir(project);

        let before = self.directory(project)?;
        let new_paths: BTreeSet<&str> = files.iter().map(|f| f.path.as_str()).collect();

        for file in files {
            let target = dir.join(&file.path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(target, &file.contents)?;
        }

        let mut missing = Vec::new();
        for path in before.files.keys() {
            if !new_paths.contains(path.as_str()) {
                fs::remove_file(dir.join(path))?;
                missing.push(path.clone());
            }
        }

        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;

        let when = Time::new(timestamp_millis / 1000, 0);
        let sig = Signature::new(&author.name, &author.email, &when)?;
        let parent = match repo.head() {
            Ok(head) => head.target().map(|oid| repo.find_commit(oid)).transpose()?,
            Err(_) => None, // unborn HEAD on a fresh repository
        };
        let parents: Vec<_> = parent.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;

        Ok(missing)
    }

    fn garbage_collect(&self, project: &ProjectName) -> Result<(), RepoError> {
        let repo = self.open(project)?;

        let mut revwalk = repo.revwalk()?;
        let mut any_refs = false;
        for reference in repo.references()? {
            if let Some(oid) = reference?.target() {
                revwalk.push(oid)?;
                any_refs = true;
            }
        }
        if !any_refs {
            return Ok(());
        }

        // Pack every reachable object, then drop the loose copies: anything
        // left loose afterwards is either packed or unreachable.
        let mut builder = repo.packbuilder()?;
        builder.insert_walk(&mut revwalk)?;
        let odb = repo.odb()?;
        let mut writer = odb.packwriter()?;
        builder.foreach(|chunk| writer.write_all(chunk).is_ok())?;
        writer.commit()?;

        let objects = self.project_dir(project).join(".git").join("objects");
        for entry in fs::read_dir(&objects)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.len() == 2 && entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())?;
            }
        }
        Ok(())
    }

    fn archive(&self, project: &ProjectName) -> Result<Box<dyn ProjectArchive>, RepoError> {
        let dir = self.project_dir(project);
        if !dir.is_dir() {
            return Err(RepoError::Missing {
                project: project.clone(),
            });
        }

        let scratch = self
            .tmp_dir()
            .join(format!("{}.tar.gz", Uuid::new_v4().simple()));
        let out = fs::File::create(&scratch)?;
        let encoder = GzEncoder::new(out, Compression::default());
        let mut tar = tar::Builder::new(encoder);
        tar.append_dir_all(".", &dir)?;
        tar.into_inner()?.finish()?.sync_all()?;

        let file = fs::File::open(&scratch)?;
        let len = file.metadata()?.len();
        Ok(Box::new(ScratchArchive {
            path: scratch,
            file,
            len,
        }))
    }

    fn restore_from_archive(
        &self,
        project: &ProjectName,
        archive: Box<dyn Read + Send>,
    ) -> Result<(), RepoError> {
        let dir = self.project_dir(project);
        if dir.exists() {
            return Err(RepoError::AlreadyExists {
                project: project.clone(),
            });
        }
        fs::create_dir_all(&dir)?;
        let mut tar = tar::Archive::new(GzDecoder::new(archive));
        tar.unpack(&dir)?;
        Ok(())
    }

    fn remove(&self, project: &ProjectName) -> Result<(), RepoError> {
        let dir = self.project_dir(project);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    fn total_size(&self) -> Result<u64, RepoError> {
        let mut total = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_str().is_some_and(|n| n.starts_with('.')) {
                continue;
            }
            if entry.file_type()?.is_dir() {
                total += dir_size(&entry.path())?;
            }
        }
        Ok(total)
    }

    fn staging_root(&self) -> PathBuf {
        self.root.join(INTERNAL_DIR).join("staging")
    }

    fn purge_nonexistent(&self, known: &[ProjectName]) -> Result<(), RepoError> {
        let known: BTreeSet<&str> = known.iter().map(ProjectName::as_str).collect();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') || known.contains(name) {
                continue;
            }
            tracing::warn!(project = name, "purging repository unknown to the metadata store");
            fs::remove_dir_all(entry.path())?;
        }
        Ok(())
    }
}

struct ScratchArchive {
    path: PathBuf,
    file: fs::File,
    len: u64,
}

impl Read for ScratchArchive {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl ProjectArchive for ScratchArchive {
    fn len(&self) -> u64 {
        self.len
    }
}

impl Drop for ScratchArchive {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn dir_size(dir: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            total += dir_size(&entry.path())?;
        } else if file_type.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}
