// Copyright (C) 2026 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! XDG-style resolution of where spdb keeps its configuration and data.

use std::env;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "spdb";

/// - $XDG_CONFIG_HOME/spdb
/// - else $HOME/.config/spdb
/// - else "."
#[must_use]
pub fn config_dir() -> PathBuf {
    resolve("XDG_CONFIG_HOME", ".config")
}

/// Relative paths land under [`config_dir`]; absolute paths are returned unchanged.
#[must_use]
pub fn config_path<P: AsRef<Path>>(relative_or_abs: P) -> PathBuf {
    let p = relative_or_abs.as_ref();
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        config_dir().join(p)
    }
}

/// - $XDG_DATA_HOME/spdb
/// - else $HOME/.local/share/spdb
/// - else "."
#[must_use]
pub fn data_dir() -> PathBuf {
    resolve("XDG_DATA_HOME", ".local/share")
}

fn resolve(xdg_var: &str, home_relative: &str) -> PathBuf {
    if let Ok(dir) = env::var(xdg_var) {
        PathBuf::from(dir).join(APP_DIR)
    } else if let Ok(home) = env::var("HOME") {
        PathBuf::from(home).join(home_relative).join(APP_DIR)
    } else {
        PathBuf::from(".")
    }
}
