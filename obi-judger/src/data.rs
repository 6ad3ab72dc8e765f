use obi_protocol::common::TestCase;
use obi_protocol::external::ProblemInfo;
use obi_utils::crypto::{constant_time_eq, hex_hmac_sha256, hex_sha256};

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use validator::Validate;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const SEAL_NAME: &str = "SEAL";
const PROBLEM_FILE: &str = "problem.toml";
const TESTS_DIR: &str = "tests";

#[derive(Debug, Clone)]
pub struct Problem {
    pub id: String,
    pub name: String,
    pub time_limit: u64,   // milliseconds
    pub memory_limit: u64, // MiB
    pub tests: Vec<TestCase>,
}

impl Problem {
    pub fn info(&self) -> ProblemInfo {
        ProblemInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            time_limit: self.time_limit,
            memory_limit: self.memory_limit,
            test_count: self.tests.len(),
        }
    }
}

/// Read-only access to problems and their ordered test cases.
pub trait ProblemStore: Send + Sync {
    fn problem(&self, id: &str) -> Result<Option<Arc<Problem>>>;
    fn list(&self) -> Vec<ProblemInfo>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    problems: BTreeMap<String, Arc<Problem>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, problem: Problem) {
        self.problems.insert(problem.id.clone(), Arc::new(problem));
    }
}

impl ProblemStore for MemoryStore {
    fn problem(&self, id: &str) -> Result<Option<Arc<Problem>>> {
        Ok(self.problems.get(id).cloned())
    }

    fn list(&self) -> Vec<ProblemInfo> {
        self.problems.values().map(|p| p.info()).collect()
    }
}

#[derive(Debug, Serialize, Deserialize, Validate)]
struct ProblemMeta {
    #[validate(length(min = 1, max = 256))]
    name: String,

    #[validate(range(min = 1, max = 60000))]
    time_limit: u64,

    #[validate(range(min = 1, max = 4096))]
    memory_limit: u64,
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-'))
}

/// Problems loaded from a zip archive built by [`build_database`].
///
/// Layout: `<id>/problem.toml`, `<id>/tests/<n>.in`, `<id>/tests/<n>.out`,
/// and a `SEAL` entry authenticating every other entry.
#[derive(Debug)]
pub struct ArchiveStore {
    inner: MemoryStore,
}

impl ArchiveStore {
    #[tracing::instrument(err, skip(password))]
    pub fn open(path: &Path, password: Option<&str>) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let mut archive = ZipArchive::new(file).context("invalid zip archive")?;

        let mut entries: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            if entry.is_dir() {
                continue;
            }
            let mut buf = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut buf)?;
            entries.insert(entry.name().to_owned(), buf);
        }

        let seal = entries.remove(SEAL_NAME);
        match (password, seal) {
            (Some(password), Some(seal)) => {
                let expected = compute_seal(password, &entries);
                let seal = String::from_utf8_lossy(&seal);
                if !constant_time_eq(seal.trim(), &expected) {
                    anyhow::bail!("database seal mismatch: wrong password or tampered archive");
                }
            }
            (Some(_), None) => anyhow::bail!("database is not sealed"),
            (None, _) => debug!("database seal not checked"),
        }

        let inner = parse_entries(&entries)?;
        info!(problems = inner.problems.len(), "database opened");
        Ok(Self { inner })
    }
}

impl ProblemStore for ArchiveStore {
    fn problem(&self, id: &str) -> Result<Option<Arc<Problem>>> {
        self.inner.problem(id)
    }

    fn list(&self) -> Vec<ProblemInfo> {
        self.inner.list()
    }
}

fn compute_seal(password: &str, entries: &BTreeMap<String, Vec<u8>>) -> String {
    let mut digest = String::new();
    for (name, content) in entries {
        digest.push_str(name);
        digest.push(':');
        digest.push_str(&hex_sha256(content));
        digest.push('\n');
    }
    hex_hmac_sha256(password.as_bytes(), digest.as_bytes())
}

#[derive(Default)]
struct TestFiles {
    input: Option<Vec<u8>>,
    output: Option<Vec<u8>>,
}

fn parse_entries(entries: &BTreeMap<String, Vec<u8>>) -> Result<MemoryStore> {
    let mut metas: BTreeMap<&str, ProblemMeta> = BTreeMap::new();
    let mut tests: BTreeMap<&str, BTreeMap<u32, TestFiles>> = BTreeMap::new();

    for (name, content) in entries {
        let parts: Vec<&str> = name.split('/').collect();
        match parts.as_slice() {
            [id, PROBLEM_FILE] => {
                let text = std::str::from_utf8(content)
                    .with_context(|| format!("{} is not utf-8", name))?;
                let meta: ProblemMeta =
                    toml::from_str(text).with_context(|| format!("invalid {}", name))?;
                meta.validate()
                    .with_context(|| format!("invalid {}", name))?;
                metas.insert(*id, meta);
            }
            [id, TESTS_DIR, file] => {
                let (stem, ext) = match file.rsplit_once('.') {
                    Some(pair) => pair,
                    None => anyhow::bail!("unexpected test file: {}", name),
                };
                let n: u32 = stem
                    .parse()
                    .with_context(|| format!("test file must be numbered: {}", name))?;
                let slot = tests.entry(*id).or_default().entry(n).or_default();
                match ext {
                    "in" => slot.input = Some(content.clone()),
                    "out" => slot.output = Some(content.clone()),
                    _ => anyhow::bail!("unexpected test file: {}", name),
                }
            }
            _ => anyhow::bail!("unexpected entry: {}", name),
        }
    }

    let mut store = MemoryStore::new();
    for (id, meta) in metas {
        if !is_valid_id(id) {
            anyhow::bail!("invalid problem id: {:?}", id);
        }

        let mut cases = Vec::new();
        for (n, files) in tests.remove(id).unwrap_or_default() {
            match (files.input, files.output) {
                (Some(input), Some(output)) => cases.push(TestCase {
                    position: cases.len(),
                    input,
                    output,
                }),
                _ => anyhow::bail!("problem {}: test {} needs both .in and .out", id, n),
            }
        }
        if cases.is_empty() {
            anyhow::bail!("problem {} has no test cases", id);
        }

        store.insert(Problem {
            id: id.to_owned(),
            name: meta.name,
            time_limit: meta.time_limit,
            memory_limit: meta.memory_limit,
            tests: cases,
        });
    }

    if let Some(id) = tests.keys().next() {
        anyhow::bail!("problem {} has tests but no {}", id, PROBLEM_FILE);
    }

    Ok(store)
}

/// A random 16-character alphanumeric key.
pub fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

fn collect_source(source: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut entries = BTreeMap::new();

    for problem_dir in fs::read_dir(source)
        .with_context(|| format!("failed to read source folder: {}", source.display()))?
    {
        let problem_dir = problem_dir?;
        if !problem_dir.file_type()?.is_dir() {
            continue;
        }
        let id = problem_dir.file_name().to_string_lossy().into_owned();

        let meta_path = problem_dir.path().join(PROBLEM_FILE);
        let meta = fs::read(&meta_path)
            .with_context(|| format!("failed to read {}", meta_path.display()))?;
        entries.insert(format!("{}/{}", id, PROBLEM_FILE), meta);

        let tests_dir = problem_dir.path().join(TESTS_DIR);
        for test in fs::read_dir(&tests_dir)
            .with_context(|| format!("failed to read {}", tests_dir.display()))?
        {
            let test = test?;
            if !test.file_type()?.is_file() {
                continue;
            }
            let name = test.file_name().to_string_lossy().into_owned();
            entries.insert(format!("{}/{}/{}", id, TESTS_DIR, name), fs::read(test.path())?);
        }
    }

    Ok(entries)
}

/// Validates a source folder and packs it into a sealed archive at `target`,
/// replacing any existing file.
#[tracing::instrument(err, skip(password))]
pub fn build_database(source: &Path, target: &Path, password: &str) -> Result<()> {
    let entries = collect_source(source)?;
    let store = parse_entries(&entries)?;
    info!(problems = store.problems.len(), "source folder validated");

    let file =
        File::create(target).with_context(|| format!("failed to create {}", target.display()))?;
    let mut zip = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    for (name, content) in &entries {
        zip.start_file(name.as_str(), options)?;
        zip.write_all(content)?;
    }

    zip.start_file(SEAL_NAME, options)?;
    zip.write_all(compute_seal(password, &entries).as_bytes())?;

    zip.finish()?;
    Ok(())
}
