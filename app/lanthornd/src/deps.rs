//! External helper availability.

use lanthorn_protocol::DepStatus;
use lanthorn_session::launcher::find_in_path;

/// Reports the helpers a client may care about. Only the debug stub
/// is actually required: archives are extracted in-process.
#[must_use]
pub fn check() -> Vec<DepStatus> {
    let have = |name: &str| find_in_path(name).is_some();
    vec![
        DepStatus {
            name: "gdbserver",
            description: "Required for debug attach and START --debug",
            available: have("gdbserver"),
            required: true,
        },
        DepStatus {
            name: "tar",
            description: "Bundles are extracted in-process; external tar is not used",
            available: have("tar"),
            required: false,
        },
        DepStatus {
            name: "gzip",
            description: "Bundles are decompressed in-process; external gzip is not used",
            available: have("gzip"),
            required: false,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_all_three_helpers() {
        let deps = check();
        let names: Vec<_> = deps.iter().map(|d| d.name).collect();
        assert_eq!(names, ["gdbserver", "tar", "gzip"]);
        assert!(deps.iter().filter(|d| d.required).count() == 1);
    }
}
