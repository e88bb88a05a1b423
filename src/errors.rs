use thiserror::Error;

#[derive(Debug, Error)]
pub enum FracmashError {
    /// Raised for internal errors in the library. Should not happen.
    #[error("internal error: {message:?}")]
    Internal { message: String },

    #[error("must have same num: {n1} != {n2}")]
    MismatchNum { n1: u32, n2: u32 },

    #[error("different ksizes cannot be compared")]
    MismatchKSizes,

    #[error("different molecule types cannot be compared")]
    MismatchMoltype,

    #[error("mismatch in scaled; comparison fail")]
    MismatchScaled,

    #[error("mismatch in seed; comparison fail")]
    MismatchSeed,

    #[error("operation requires a scaled sketch: {message}")]
    NeedsScaled { message: String },

    #[error("operation requires abundance tracking")]
    NeedsAbundance,

    #[error("cannot downsample from scaled {old} to {new}")]
    CannotDownsample { old: u64, new: u64 },

    #[error("cannot convert a scaled sketch back to a num sketch")]
    CannotUpsampleScaled,

    #[error("can only set {message:?} if the sketch is empty")]
    NonEmptyMinHash { message: String },

    #[error("invalid DNA character in input k-mer: {message}")]
    InvalidDNA { message: String },

    #[error("invalid protein character in input: {message}")]
    InvalidProt { message: String },

    #[error("codon is invalid length: {message}")]
    InvalidCodonLength { message: String },

    #[error("invalid hash function: {function:?}")]
    InvalidHashFunction { function: String },

    #[error("unknown molecule type: {moltype}")]
    UnknownMoltype { moltype: String },

    #[error("md5sum mismatch: expected {expected}, computed {computed}")]
    Md5sumMismatch { expected: String, computed: String },

    #[error("sketch declares both num and scaled; refusing to load")]
    InvalidSketchParams,

    #[error("cannot estimate ANI: {message}")]
    ANIEstimationError { message: String },

    #[error("on-disk index format not supported: {message}")]
    IndexNotSupported { message: String },

    #[error("identifier not found: {ident}")]
    MissingIdentifier { ident: String },

    #[error("no signatures matched the given selection")]
    EmptySelection,

    #[error("cannot store {message} in a SQLite index")]
    SqliteIndexRestriction { message: String },

    #[error("error loading {path}: {source}")]
    LoadError {
        path: String,
        #[source]
        source: Box<FracmashError>,
    },

    #[error(transparent)]
    StorageError(#[from] crate::storage::StorageError),

    #[error(transparent)]
    SerdeError(#[from] serde_json::error::Error),

    #[error(transparent)]
    NifflerError(#[from] niffler::Error),

    #[error(transparent)]
    CsvError(#[from] csv::Error),

    #[error(transparent)]
    SqliteError(#[from] rusqlite::Error),

    #[error(transparent)]
    ZipError(#[from] zip::result::ZipError),

    #[error(transparent)]
    Utf8Error(#[from] std::str::Utf8Error),

    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

impl FracmashError {
    /// Wrap an error with the path that was being loaded when it happened.
    pub fn while_loading(self, path: &str) -> Self {
        FracmashError::LoadError {
            path: path.into(),
            source: Box::new(self),
        }
    }
}
