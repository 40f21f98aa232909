use super::*;

/// Errors that can occur when rendering stats or writing them on disk.
#[derive(Debug)]
pub enum ExportError {
  Io(io::Error),
  Json(serde_json::Error),
  /// No output path given and no environment default configured for the
  /// requested format.
  NoOutputPath(OutputFormat),
}

impl Display for ExportError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::Io(err) => write!(f, "i/o error during export: {err}"),
      Self::Json(err) => write!(f, "failed to encode stats as json: {err}"),
      Self::NoOutputPath(format) => {
        write!(f, "no output path given or configured for {format:?} output")
      }
    }
  }
}

impl std::error::Error for ExportError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Self::Io(err) => Some(err),
      Self::Json(err) => Some(err),
      Self::NoOutputPath(_) => None,
    }
  }
}

impl From<io::Error> for ExportError {
  fn from(value: io::Error) -> Self {
    Self::Io(value)
  }
}

impl From<serde_json::Error> for ExportError {
  fn from(value: serde_json::Error) -> Self {
    Self::Json(value)
  }
}

/// Default dump path for a format, taken from the environment. Only JSON and
/// DOT have configurable defaults.
pub(crate) fn default_output_path(format: OutputFormat) -> Option<PathBuf> {
  let var = match format {
    OutputFormat::Json => crate::config::STATS_OUTPUT_JSON_ENV,
    OutputFormat::GraphvizDot => crate::config::STATS_OUTPUT_DOT_ENV,
    OutputFormat::HumanReadable | OutputFormat::All => return None,
  };

  env::var_os(var).filter(|value| !value.is_empty()).map(PathBuf::from)
}

/// Resolves the effective dump path: an explicit path wins, then the
/// format's environment default.
///
/// # Errors
///
/// Returns `ExportError::NoOutputPath` when neither is available.
pub(crate) fn resolve_output_path(
  format: OutputFormat,
  explicit: Option<&Path>,
) -> Result<PathBuf, ExportError> {
  if let Some(path) = explicit {
    return Ok(path.to_path_buf());
  }

  default_output_path(format).ok_or(ExportError::NoOutputPath(format))
}

/// # Errors
///
/// Returns an error if the file cannot be created or written.
pub(crate) fn write_text_file(path: &Path, contents: &str) -> Result<(), ExportError> {
  fs::write(path, contents)?;
  log::debug!("wrote {} bytes to {}", contents.len(), path.display());
  Ok(())
}
