use clap::ValueEnum;
use std::ffi::OsString;

/// Scale of the numbers written to stdout.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProgressScale {
    /// 0.0000 ..= 1.0000
    #[default]
    Fraction,
    /// 0.00 ..= 100.00
    Percent,
}

/// Rewrites the single-dash `-url` form used by the desktop shell into `--url`
/// so clap does not read it as the short flags `-u -r -l`.
pub fn normalize_legacy_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .map(|arg| match arg.to_str() {
            Some("-url") => OsString::from("--url"),
            Some(s) if s.starts_with("-url=") => OsString::from(format!("-{}", s)),
            _ => arg,
        })
        .collect()
}
