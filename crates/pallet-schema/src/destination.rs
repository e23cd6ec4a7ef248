use serde::{Deserialize, Serialize};
use std::fmt;

/// Named install location, resolved relative to the install prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    Bin,
    Sbin,
    Libexec,
    Lib,
    Include,
    Share,
    Etc,
    Man1,
    BashCompletion,
    ZshCompletion,
    FishCompletion,
}

impl Destination {
    pub const ALL: [Destination; 11] = [
        Destination::Bin,
        Destination::Sbin,
        Destination::Libexec,
        Destination::Lib,
        Destination::Include,
        Destination::Share,
        Destination::Etc,
        Destination::Man1,
        Destination::BashCompletion,
        Destination::ZshCompletion,
        Destination::FishCompletion,
    ];

    /// Directory under the prefix, `/`-separated.
    pub fn relative_dir(self) -> &'static str {
        match self {
            Destination::Bin => "bin",
            Destination::Sbin => "sbin",
            Destination::Libexec => "libexec",
            Destination::Lib => "lib",
            Destination::Include => "include",
            Destination::Share => "share",
            Destination::Etc => "etc",
            Destination::Man1 => "share/man/man1",
            Destination::BashCompletion => "etc/bash_completion.d",
            Destination::ZshCompletion => "share/zsh/site-functions",
            Destination::FishCompletion => "share/fish/vendor_completions.d",
        }
    }

    /// Files placed here get their execute bits set.
    pub fn is_executable(self) -> bool {
        matches!(
            self,
            Destination::Bin | Destination::Sbin | Destination::Libexec
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Destination::Bin => "bin",
            Destination::Sbin => "sbin",
            Destination::Libexec => "libexec",
            Destination::Lib => "lib",
            Destination::Include => "include",
            Destination::Share => "share",
            Destination::Etc => "etc",
            Destination::Man1 => "man1",
            Destination::BashCompletion => "bash_completion",
            Destination::ZshCompletion => "zsh_completion",
            Destination::FishCompletion => "fish_completion",
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
