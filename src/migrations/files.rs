//! Embedded migration and seed files.
//!
//! Files are named `{version}__{description}.sql`, where `version` is the
//! integer encoding of a [`Version`] (`10002` is `1.2`).

use std::sync::LazyLock;

use regex::Regex;
use rust_embed::Embed;

use crate::error::MigrationError;
use crate::version::Version;

#[derive(Embed)]
#[folder = "migration/"]
struct EmbeddedMigrations;

#[derive(Embed)]
#[folder = "seed/"]
struct EmbeddedSeeds;

static FILE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<version>[0-9]+)__(?P<description>[A-Za-z0-9_\-]+)\.sql$")
        .expect("file name pattern is valid")
});

/// One migration or seed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    /// Base file name, e.g. `10001__add_activity.sql`.
    pub name: String,
    pub version: Version,
    /// Description with underscores turned into spaces.
    pub description: String,
    pub body: String,
}

impl MigrationFile {
    /// Parses a file name and its contents. Any directory prefix in `name`
    /// is dropped.
    pub fn parse(name: &str, body: &[u8]) -> Result<Self, MigrationError> {
        let base = name.rsplit('/').next().unwrap_or(name);
        let invalid = |reason: &str| MigrationError::InvalidFileName {
            name: base.to_string(),
            reason: reason.to_string(),
        };

        let caps = FILE_NAME
            .captures(base)
            .ok_or_else(|| invalid("expected {version}__{description}.sql"))?;
        let encoded: i64 = caps["version"]
            .parse()
            .map_err(|_| invalid("version does not fit in 64 bits"))?;
        if encoded <= 0 {
            return Err(invalid("version must be positive"));
        }
        let version = Version::from_int(encoded);
        if version.to_int() != encoded {
            return Err(invalid("major version does not fit in 32 bits"));
        }
        let body = std::str::from_utf8(body)
            .map_err(|_| MigrationError::InvalidEncoding {
                name: base.to_string(),
            })?
            .to_string();

        Ok(Self {
            name: base.to_string(),
            version,
            description: caps["description"].replace('_', " "),
            body,
        })
    }
}

/// Files sorted by ascending version, at most one per version.
#[derive(Debug, Clone, Default)]
pub struct MigrationSet {
    files: Vec<MigrationFile>,
}

impl MigrationSet {
    /// Sorts `files` by version. Two files with the same version are an
    /// error, whatever their descriptions.
    pub fn from_files(
        files: impl IntoIterator<Item = MigrationFile>,
    ) -> Result<Self, MigrationError> {
        let mut files: Vec<MigrationFile> = files.into_iter().collect();
        files.sort_by(|a, b| a.version.cmp(&b.version).then_with(|| a.name.cmp(&b.name)));
        if let Some(pair) = files.windows(2).find(|w| w[0].version == w[1].version) {
            return Err(MigrationError::DuplicateVersion {
                version: pair[0].version,
                first: pair[0].name.clone(),
                second: pair[1].name.clone(),
            });
        }
        Ok(Self { files })
    }

    /// Parses `(name, body)` pairs, skipping names that are not `.sql`.
    pub fn parse<N, B>(entries: impl IntoIterator<Item = (N, B)>) -> Result<Self, MigrationError>
    where
        N: AsRef<str>,
        B: AsRef<[u8]>,
    {
        let files = entries
            .into_iter()
            .filter(|(name, _)| name.as_ref().ends_with(".sql"))
            .map(|(name, body)| MigrationFile::parse(name.as_ref(), body.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_files(files)
    }

    /// Schema migrations compiled into the binary.
    pub fn embedded_migrations() -> Result<Self, MigrationError> {
        Self::parse(
            EmbeddedMigrations::iter()
                .filter_map(|name| EmbeddedMigrations::get(&name).map(|file| (name, file.data))),
        )
    }

    /// Seed files compiled into the binary.
    pub fn embedded_seeds() -> Result<Self, MigrationError> {
        Self::parse(
            EmbeddedSeeds::iter()
                .filter_map(|name| EmbeddedSeeds::get(&name).map(|file| (name, file.data))),
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = &MigrationFile> {
        self.files.iter()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn get(&self, version: Version) -> Option<&MigrationFile> {
        self.files
            .binary_search_by(|f| f.version.cmp(&version))
            .ok()
            .map(|i| &self.files[i])
    }

    /// Files whose version lies in `(after, up_to]`.
    pub fn window(&self, after: Version, up_to: Version) -> impl Iterator<Item = &MigrationFile> {
        self.files
            .iter()
            .filter(move |f| f.version.bigger_than(&after) && !f.version.bigger_than(&up_to))
    }
}
