use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use serde_sarif::sarif::{Artifact, ArtifactLocation, ArtifactRoles};
use tracing::debug;
use zip::ZipArchive;

/// Class bytes found while scanning, with the artifact they came from.
pub(crate) struct ScannedClass {
    pub(crate) uri: String,
    pub(crate) bytes: Vec<u8>,
    /// False for classes found only on the classpath.
    pub(crate) is_input: bool,
}

/// Snapshot of artifacts and class bytes for a scan.
pub(crate) struct ScanOutput {
    pub(crate) artifacts: Vec<Artifact>,
    pub(crate) classes: Vec<ScannedClass>,
}

impl ScanOutput {
    pub(crate) fn class_count(&self) -> usize {
        self.classes.len()
    }
}

pub(crate) fn scan_inputs(input: &Path, classpath: &[PathBuf]) -> Result<ScanOutput> {
    let mut output = ScanOutput {
        artifacts: Vec::new(),
        classes: Vec::new(),
    };

    scan_path(input, true, true, &mut output)?;

    // Keep deterministic ordering by sorting classpath entries and directory listings.
    let mut classpath_entries = classpath.to_vec();
    classpath_entries.sort_by_key(|entry| path_key(entry));

    for entry in classpath_entries {
        scan_path(&entry, false, true, &mut output)?;
    }

    debug!(
        artifacts = output.artifacts.len(),
        classes = output.classes.len(),
        "scanned inputs"
    );
    Ok(output)
}

fn scan_path(path: &Path, is_input: bool, strict: bool, output: &mut ScanOutput) -> Result<()> {
    if path.is_dir() {
        scan_dir(path, is_input, output)?;
        return Ok(());
    }

    let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
    let roles = if is_input {
        Some(vec![
            serde_json::to_value(ArtifactRoles::AnalysisTarget).context("serialize artifact role")?,
        ])
    } else {
        None
    };

    match extension {
        "class" => scan_class_file(path, is_input, roles, output),
        "jar" => scan_jar_file(path, is_input, roles, output),
        _ => {
            if strict {
                anyhow::bail!("unsupported input file: {}", path.display())
            } else {
                Ok(())
            }
        }
    }
}

fn scan_dir(path: &Path, is_input: bool, output: &mut ScanOutput) -> Result<()> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path).with_context(|| format!("failed to read directory {}", path.display()))? {
        let entry = entry.with_context(|| format!("failed to read entry under {}", path.display()))?;
        entries.push(entry.path());
    }

    entries.sort_by_key(|entry| path_key(entry));

    for entry in entries {
        if entry.is_dir() {
            scan_dir(&entry, is_input, output)?;
        } else {
            scan_path(&entry, is_input, false, output)?;
        }
    }

    Ok(())
}

fn scan_class_file(path: &Path, is_input: bool, roles: Option<Vec<Value>>, output: &mut ScanOutput) -> Result<()> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let uri = path_to_uri(path);
    push_artifact(uri.clone(), data.len() as u64, None, roles, &mut output.artifacts);
    output.classes.push(ScannedClass {
        uri,
        bytes: data,
        is_input,
    });
    Ok(())
}

fn scan_jar_file(path: &Path, is_input: bool, roles: Option<Vec<Value>>, output: &mut ScanOutput) -> Result<()> {
    let file = fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive = ZipArchive::new(file).with_context(|| format!("failed to read {}", path.display()))?;

    let jar_len = fs::metadata(path)
        .with_context(|| format!("failed to read {}", path.display()))?
        .len();
    let jar_index = push_artifact(path_to_uri(path), jar_len, None, roles, &mut output.artifacts);

    let mut entry_names = Vec::new();
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        if name.ends_with(".class") && !name.ends_with("module-info.class") {
            entry_names.push(name);
        }
    }

    entry_names.sort();

    for name in entry_names {
        let mut entry = archive
            .by_name(&name)
            .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .with_context(|| format!("failed to read {}:{}", path.display(), name))?;

        let entry_uri = jar_entry_uri(path, &name);
        push_artifact(entry_uri.clone(), entry.size(), Some(jar_index), None, &mut output.artifacts);
        output.classes.push(ScannedClass {
            uri: entry_uri,
            bytes: data,
            is_input,
        });
    }

    Ok(())
}

fn push_artifact(
    uri: String,
    len: u64,
    parent_index: Option<i64>,
    roles: Option<Vec<Value>>,
    artifacts: &mut Vec<Artifact>,
) -> i64 {
    let location = ArtifactLocation::builder().uri(uri).build();
    let artifact = match (parent_index, roles) {
        (Some(parent_index), Some(roles)) => Artifact::builder()
            .location(location)
            .length(len as i64)
            .parent_index(parent_index)
            .roles(roles)
            .build(),
        (Some(parent_index), None) => Artifact::builder()
            .location(location)
            .length(len as i64)
            .parent_index(parent_index)
            .build(),
        (None, Some(roles)) => Artifact::builder()
            .location(location)
            .length(len as i64)
            .roles(roles)
            .build(),
        (None, None) => Artifact::builder().location(location).length(len as i64).build(),
    };
    let index = artifacts.len() as i64;
    artifacts.push(artifact);
    index
}

fn path_to_uri(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn jar_entry_uri(jar_path: &Path, entry_name: &str) -> String {
    format!("jar:{}!/{}", jar_path.to_string_lossy(), entry_name)
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    use super::*;

    fn write_jar(path: &Path, entries: &[(&str, &[u8])]) {
        let file = fs::File::create(path).expect("create jar");
        let mut writer = ZipWriter::new(file);
        for (name, data) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .expect("start entry");
            writer.write_all(data).expect("write entry");
        }
        writer.finish().expect("finish jar");
    }

    fn uri(artifact: &Artifact) -> String {
        artifact
            .location
            .as_ref()
            .and_then(|location| location.uri.as_ref())
            .cloned()
            .expect("artifact uri")
    }

    #[test]
    fn scan_inputs_rejects_unsupported_input() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("notes.txt");
        fs::write(&path, b"text").expect("write file");

        assert!(scan_inputs(&path, &[]).is_err());
    }

    #[test]
    fn scan_inputs_collects_class_file_bytes() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let class_path = temp_dir.path().join("Sample.class");
        fs::write(&class_path, b"\xCA\xFE\xBA\xBE").expect("write class file");

        let result = scan_inputs(&class_path, &[]).expect("scan class");

        assert_eq!(result.class_count(), 1);
        assert_eq!(result.artifacts.len(), 1);
        assert_eq!(result.classes[0].bytes, b"\xCA\xFE\xBA\xBE");
        assert!(result.classes[0].is_input);
        assert!(result.artifacts[0].roles.is_some());
    }

    #[test]
    fn scan_inputs_reads_jar_entries_in_name_order() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let jar_path = temp_dir.path().join("lib.jar");
        write_jar(
            &jar_path,
            &[
                ("b/B.class", b"b"),
                ("META-INF/MANIFEST.MF", b"Manifest-Version: 1.0\n"),
                ("module-info.class", b"m"),
                ("a/A.class", b"a"),
            ],
        );

        let result = scan_inputs(&jar_path, &[]).expect("scan jar");

        let uris: Vec<String> = result.artifacts.iter().map(uri).collect();
        assert!(uris[0].ends_with("lib.jar"));
        assert!(uris[1].ends_with("lib.jar!/a/A.class"));
        assert!(uris[2].ends_with("lib.jar!/b/B.class"));
        assert_eq!(result.artifacts[1].parent_index, Some(0));
        assert_eq!(result.classes.len(), 2);
        assert_eq!(result.classes[0].bytes, b"a");
    }

    #[test]
    fn classpath_classes_are_not_inputs() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let input = temp_dir.path().join("input");
        let library = temp_dir.path().join("library");
        fs::create_dir_all(input.join("nested")).expect("input dir");
        fs::create_dir_all(&library).expect("library dir");
        fs::write(input.join("nested/Z.class"), b"z").expect("write");
        fs::write(input.join("A.class"), b"a").expect("write");
        fs::write(input.join("README"), b"skip").expect("write");
        fs::write(library.join("L.class"), b"l").expect("write");

        let result = scan_inputs(&input, &[library]).expect("scan");

        let flags: Vec<(bool, &[u8])> = result
            .classes
            .iter()
            .map(|class| (class.is_input, class.bytes.as_slice()))
            .collect();
        assert_eq!(flags, vec![(true, &b"a"[..]), (true, &b"z"[..]), (false, &b"l"[..])]);
    }
}
