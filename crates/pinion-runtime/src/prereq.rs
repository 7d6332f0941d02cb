use std::fmt;
use std::process::Command;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: String,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

pub(crate) fn command_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn pip_works() -> bool {
    Command::new("python3")
        .args(["-m", "pip", "--version"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Tools the default install and run recipes rely on.
/// An empty list means all prerequisites are met.
pub fn check_host_prereqs() -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    if !command_exists("git") {
        missing.push(MissingPrereq {
            name: "git".to_owned(),
            purpose: "cloning package repositories",
            install_hint: "zypper install git | apt install git | dnf install git | pacman -S git",
        });
    }

    if !command_exists("python3") {
        missing.push(MissingPrereq {
            name: "python3".to_owned(),
            purpose: "running package entry scripts",
            install_hint:
                "zypper install python3 | apt install python3 | dnf install python3 | pacman -S python",
        });
    } else if !pip_works() {
        missing.push(MissingPrereq {
            name: "pip".to_owned(),
            purpose: "installing package requirements",
            install_hint: "apt install python3-pip | dnf install python3-pip | python3 -m ensurepip",
        });
    }

    missing
}

/// The tunnel client binary.
pub fn check_tunnel_prereqs(binary: &str) -> Vec<MissingPrereq> {
    if command_exists(binary) {
        return Vec::new();
    }
    vec![MissingPrereq {
        name: binary.to_owned(),
        purpose: "exposing running packages through a public URL",
        install_hint: "see https://developers.cloudflare.com/cloudflare-one/connections/connect-networks/downloads/",
    }]
}

/// Format a list of missing prerequisites into a user-friendly message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nPinion needs these tools to install, run, or expose packages.");
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_prereq_display() {
        let m = MissingPrereq {
            name: "git".to_owned(),
            purpose: "cloning",
            install_hint: "apt install git",
        };
        let s = m.to_string();
        assert!(s.contains("git"));
        assert!(s.contains("cloning"));
        assert!(s.contains("apt install git"));
    }

    #[test]
    fn format_missing_lists_every_item() {
        let items = vec![
            MissingPrereq {
                name: "git".to_owned(),
                purpose: "cloning",
                install_hint: "apt install git",
            },
            MissingPrereq {
                name: "cloudflared".to_owned(),
                purpose: "tunnels",
                install_hint: "download",
            },
        ];
        let output = format_missing(&items);
        assert!(output.starts_with("missing prerequisites:"));
        assert!(output.contains("git"));
        assert!(output.contains("cloudflared"));
    }

    #[test]
    fn absent_tunnel_binary_is_reported() {
        let missing = check_tunnel_prereqs("pinion-no-such-binary");
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].name, "pinion-no-such-binary");
    }
}
