// Copyright © 2025 Cyberus Technology GmbH
//
// SPDX-License-Identifier: Apache-2.0

use std::error::Error;

/// One line per error of the chain below `top_error`, outermost first.
///
/// A lone error is not numbered.
pub fn error_chain_lines(top_error: &dyn Error) -> Vec<String> {
    if top_error.source().is_none() {
        return vec![format!("  {top_error}")];
    }

    std::iter::successors(Some(top_error), |sub_error| {
        // Dereference necessary to mitigate rustc compiler bug.
        // See <https://github.com/rust-lang/rust/issues/141673>
        (*sub_error).source()
    })
    .enumerate()
    .map(|(level, error)| format!("  {level}: {error}"))
    .collect()
}

/// Prints a chain of errors to the user in a consistent manner, followed by
/// debug output for opening issues.
pub fn cli_print_error_chain(top_error: &dyn Error, component: &str) {
    let lines = error_chain_lines(top_error);
    let what = if lines.len() == 1 {
        "error"
    } else {
        "chain of errors"
    };

    eprintln!("Error: {component} exited with the following {what}:");
    for line in lines {
        eprintln!("{line}");
    }
    eprintln!();
    eprintln!("Debug Info: {top_error:?}");
}
