//! Plugin installation and module management.
//!
//! Installing is split in two phases so the registry can hold its per-app
//! lock only around the part that touches the live app:
//!
//! 1. [`PluginLoader::stage`] downloads or reads the archive and extracts it
//!    into `apps/.staging-<uuid>`. Any failure removes the staging directory.
//! 2. [`PluginLoader::commit`] moves the staged tree to `apps/<id>`,
//!    replacing a previous install.
//!
//! Loaded modules live in a [`ModuleTable`]; unloading drops the module and
//! bumps the generation so old handles stop resolving.

use std::io::{Cursor, Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use deckhost_core::{
    AppDescriptor, AppManifest, ConfigStore, InstallError, LifecycleError, LoadError,
};
use deckhost_mappings::ButtonMappingEngine;
use parking_lot::RwLock;
use zip::ZipArchive;

use crate::fetch::PackageFetcher;
use crate::handle::{ModuleHandle, ModuleTable};
use crate::module::{AppModule, HookSet, ModuleLoader, OutboundSender};

/// Manifest file name inside every package.
pub const MANIFEST_FILE: &str = "manifest.json";

const STAGING_PREFIX: &str = ".staging-";

/// Where a package comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageSource {
    /// A zip archive on local disk.
    Archive(PathBuf),
    /// A zip archive to download.
    Url(String),
    /// An unpacked directory registered in place.
    Developer(PathBuf),
}

impl PackageSource {
    /// `http://` and `https://` are URLs, anything else is an archive path.
    pub fn parse(source: &str) -> Self {
        if source.starts_with("http://") || source.starts_with("https://") {
            PackageSource::Url(source.to_string())
        } else {
            PackageSource::Archive(PathBuf::from(source))
        }
    }
}

/// An extracted package waiting to be committed.
#[derive(Debug)]
pub struct StagedPackage {
    pub manifest: AppManifest,
    dir: PathBuf,
    developer: bool,
}

impl StagedPackage {
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn fs_error(context: &str, path: &Path, e: std::io::Error) -> InstallError {
    InstallError::Filesystem(format!("{} {:?}: {}", context, path, e))
}

fn parse_manifest(bytes: &[u8]) -> Result<AppManifest, InstallError> {
    let manifest: AppManifest =
        serde_json::from_slice(bytes).map_err(|e| InstallError::Manifest(e.to_string()))?;
    manifest
        .validate()
        .map_err(|e| InstallError::Manifest(e.0))?;
    Ok(manifest)
}

/// Directory prefix holding the manifest: the archive root, or a single
/// top-level folder.
fn package_root<'a>(names: impl Iterator<Item = &'a str>) -> Option<String> {
    let mut nested = Vec::new();
    for name in names {
        if name == MANIFEST_FILE {
            return Some(String::new());
        }
        if let Some((dir, MANIFEST_FILE)) = name.split_once('/') {
            nested.push(dir.to_string());
        }
    }
    match nested.as_slice() {
        [dir] => Some(format!("{}/", dir)),
        _ => None,
    }
}

/// Extract a zip archive into `dest` and return its manifest.
fn unpack<R: Read + Seek>(reader: R, dest: &Path) -> Result<AppManifest, InstallError> {
    let corrupt = |e: zip::result::ZipError| InstallError::CorruptArchive(e.to_string());

    let mut archive = ZipArchive::new(reader).map_err(corrupt)?;
    let root = package_root(archive.file_names())
        .ok_or_else(|| InstallError::Manifest(format!("package has no {}", MANIFEST_FILE)))?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i).map_err(corrupt)?;
        let Some(enclosed) = file.enclosed_name() else {
            return Err(InstallError::CorruptArchive(format!(
                "unsafe entry path '{}'",
                file.name()
            )));
        };
        let Ok(relative) = enclosed.strip_prefix(&root) else {
            continue;
        };
        if relative.as_os_str().is_empty() {
            continue;
        }

        let target = dest.join(relative);
        if file.is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| fs_error("creating", &target, e))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| fs_error("creating", parent, e))?;
        }
        let mut out =
            std::fs::File::create(&target).map_err(|e| fs_error("creating", &target, e))?;
        std::io::copy(&mut file, &mut out).map_err(|e| fs_error("writing", &target, e))?;
    }

    let manifest_path = dest.join(MANIFEST_FILE);
    let bytes =
        std::fs::read(&manifest_path).map_err(|e| fs_error("reading", &manifest_path, e))?;
    parse_manifest(&bytes)
}

/// Installs packages and owns the table of loaded modules.
pub struct PluginLoader {
    apps_dir: PathBuf,
    store: ConfigStore,
    mappings: Arc<ButtonMappingEngine>,
    modules: Arc<dyn ModuleLoader>,
    fetcher: Arc<dyn PackageFetcher>,
    table: RwLock<ModuleTable<Arc<dyn AppModule>>>,
    outbound: OutboundSender,
}

impl PluginLoader {
    pub fn new(
        apps_dir: impl Into<PathBuf>,
        store: ConfigStore,
        mappings: Arc<ButtonMappingEngine>,
        modules: Arc<dyn ModuleLoader>,
        fetcher: Arc<dyn PackageFetcher>,
        outbound: OutboundSender,
    ) -> Self {
        Self {
            apps_dir: apps_dir.into(),
            store,
            mappings,
            modules,
            fetcher,
            table: RwLock::new(ModuleTable::new()),
            outbound,
        }
    }

    pub fn apps_dir(&self) -> &Path {
        &self.apps_dir
    }

    // =========================================================================
    // Install
    // =========================================================================

    /// Install in one step. The registry uses [`stage`](Self::stage) and
    /// [`commit`](Self::commit) directly.
    pub async fn install(&self, source: PackageSource) -> Result<AppDescriptor, InstallError> {
        let staged = self.stage(source).await?;
        self.commit(staged).await
    }

    /// Fetch and extract a package without touching any installed app.
    pub async fn stage(&self, source: PackageSource) -> Result<StagedPackage, InstallError> {
        let bytes = match source {
            PackageSource::Developer(dir) => return self.stage_developer(&dir).await,
            PackageSource::Archive(path) => tokio::fs::read(&path)
                .await
                .map_err(|e| fs_error("reading", &path, e))?,
            PackageSource::Url(url) => self.fetcher.fetch(&url).await?,
        };

        tokio::fs::create_dir_all(&self.apps_dir)
            .await
            .map_err(|e| fs_error("creating", &self.apps_dir, e))?;

        let staging = self
            .apps_dir
            .join(format!("{}{}", STAGING_PREFIX, uuid::Uuid::new_v4().simple()));
        let dest = staging.clone();

        let result = tokio::task::spawn_blocking(move || unpack(Cursor::new(bytes), &dest))
            .await
            .unwrap_or_else(|e| Err(InstallError::Filesystem(format!("extract task failed: {}", e))));

        match result {
            Ok(manifest) => {
                tracing::debug!("Staged '{}' {} at {:?}", manifest.id, manifest.version, staging);
                Ok(StagedPackage {
                    manifest,
                    dir: staging,
                    developer: false,
                })
            }
            Err(e) => {
                self.discard_dir(&staging).await;
                Err(e)
            }
        }
    }

    async fn stage_developer(&self, dir: &Path) -> Result<StagedPackage, InstallError> {
        let dir = tokio::fs::canonicalize(dir)
            .await
            .map_err(|e| fs_error("resolving", dir, e))?;
        let manifest_path = dir.join(MANIFEST_FILE);
        let bytes = tokio::fs::read(&manifest_path)
            .await
            .map_err(|e| fs_error("reading", &manifest_path, e))?;
        let manifest = parse_manifest(&bytes)?;
        Ok(StagedPackage {
            manifest,
            dir,
            developer: true,
        })
    }

    /// Move a staged package into `apps/<id>`, replacing any previous files.
    pub async fn commit(&self, staged: StagedPackage) -> Result<AppDescriptor, InstallError> {
        let StagedPackage {
            manifest,
            dir,
            developer,
        } = staged;

        if developer {
            let mut app = AppDescriptor::installed(manifest, dir);
            app.developer = true;
            return Ok(app);
        }

        let target = self.apps_dir.join(&manifest.id);
        if let Err(e) = self.replace_dir(&dir, &target).await {
            self.discard_dir(&dir).await;
            return Err(e);
        }

        tracing::info!("Installed '{}' {} into {:?}", manifest.id, manifest.version, target);
        Ok(AppDescriptor::installed(manifest, target))
    }

    async fn replace_dir(&self, from: &Path, to: &Path) -> Result<(), InstallError> {
        match tokio::fs::remove_dir_all(to).await {
            Ok(()) => tracing::debug!("Replaced previous files at {:?}", to),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(fs_error("removing", to, e)),
        }
        tokio::fs::rename(from, to)
            .await
            .map_err(|e| fs_error("moving into", to, e))
    }

    /// Throw away a staged package.
    pub async fn discard(&self, staged: StagedPackage) {
        if !staged.developer {
            self.discard_dir(&staged.dir).await;
        }
    }

    async fn discard_dir(&self, dir: &Path) {
        if let Err(e) = tokio::fs::remove_dir_all(dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to clean up {:?}: {}", dir, e);
            }
        }
    }

    // =========================================================================
    // Modules
    // =========================================================================

    /// Load the app's entry script under a fresh generation.
    pub async fn load(&self, app: &AppDescriptor) -> Result<HookSet, LoadError> {
        let module = self.modules.load(app, self.outbound.clone()).await?;
        let hooks = module.hooks();

        let (handle, previous) = self.table.write().insert(&app.name, module);
        if previous.is_some() {
            tracing::debug!("Replaced loaded module for '{}'", app.name);
        }
        tracing::debug!("Module '{}' at generation {}", app.name, handle.generation());
        Ok(hooks)
    }

    /// Drop the loaded module. Unloading something that is not loaded is
    /// fine.
    pub fn unload(&self, name: &str) -> bool {
        let removed = self.table.write().remove(name).is_some();
        if !removed {
            tracing::debug!("Unload of '{}': nothing loaded", name);
        }
        removed
    }

    pub fn module(&self, name: &str) -> Option<Arc<dyn AppModule>> {
        self.table
            .read()
            .current(name)
            .map(|(_, module)| module.clone())
    }

    pub fn handle(&self, name: &str) -> Option<ModuleHandle> {
        self.table.read().current(name).map(|(handle, _)| handle)
    }

    /// Resolve a handle. `None` once the module was unloaded or reloaded.
    pub fn resolve(&self, handle: &ModuleHandle) -> Option<Arc<dyn AppModule>> {
        self.table.read().get(handle).cloned()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.table.read().contains(name)
    }

    // =========================================================================
    // Purge
    // =========================================================================

    /// Delete everything the app left behind: stored data and config, its
    /// keys and actions, and its directory. Developer apps keep their files.
    ///
    /// Every step is attempted; failures are collected.
    pub async fn purge_files(&self, app: &AppDescriptor) -> Result<(), LifecycleError> {
        let name = app.name.as_str();
        let mut errors = Vec::new();

        self.unload(name);

        for key in [format!("data/{}", name), format!("config/{}", name)] {
            if let Err(e) = self.store.remove(&key).await {
                errors.push(e.to_string());
            }
        }

        if let Err(e) = self.mappings.purge_source(name).await {
            errors.push(e.to_string());
        }

        if let Err(e) = self.remove_files(app).await {
            errors.push(format!("removing {:?}: {}", app.path, e));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(LifecycleError::Purge {
                app: name.to_string(),
                errors,
            })
        }
    }

    /// Delete the app's directory if the host manages it. Developer
    /// directories and anything outside `apps/` are left alone.
    pub async fn remove_files(&self, app: &AppDescriptor) -> std::io::Result<()> {
        let name = app.name.as_str();
        if app.developer {
            tracing::info!("Keeping files of developer app '{}' at {:?}", name, app.path);
            return Ok(());
        }
        if !app.path.starts_with(&self.apps_dir) {
            tracing::warn!(
                "Not deleting {:?} for '{}': outside {:?}",
                app.path,
                name,
                self.apps_dir
            );
            return Ok(());
        }
        match tokio::fs::remove_dir_all(&app.path).await {
            Ok(()) => {
                tracing::debug!("Removed {:?} of '{}'", app.path, name);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("Directory of '{}' already gone", name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

// =============================================================================
// Test helpers
// =============================================================================

/// Build a package archive in memory.
#[cfg(test)]
pub(crate) fn build_package(files: &[(&str, &str)]) -> Vec<u8> {
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for (name, contents) in files {
        zip.start_file(*name, options).unwrap();
        zip.write_all(contents.as_bytes()).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

#[cfg(test)]
pub(crate) fn manifest_json(id: &str, version: &str) -> String {
    serde_json::json!({ "id": id, "version": version }).to_string()
}
