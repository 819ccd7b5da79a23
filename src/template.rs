// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Select boot command templates and substitute resolved placeholders.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use regex::Regex;

use crate::error::BootError;
use crate::tags::{self, TagMap};

/// Template used for kernel + ramdisk deployments.
pub const RAMDISK_TEMPLATE: &str = "boot_cmds_ramdisk";
/// Template used when an NFS root is exported.
pub const NFS_TEMPLATE: &str = "boot_cmds_nfs";
/// Template used for prebuilt image deployments.
pub const IMAGE_TEMPLATE: &str = "boot_cmds";

const SENDLINE: &str = "sendline ";
const EXPECT: &str = "expect ";

/// Named boot command templates from the target configuration.
#[derive(Debug, Clone, Default)]
pub struct BootTemplates {
    templates: BTreeMap<String, Vec<String>>,
}

impl BootTemplates {
    /// Wrap the `[boot_cmds]` table.
    #[must_use]
    pub fn new(templates: BTreeMap<String, Vec<String>>) -> Self {
        Self { templates }
    }

    /// Resolve the template name: an explicit override wins over the deployment default.
    pub fn select<'a>(
        &'a self,
        override_name: Option<&'a str>,
        default_name: &'a str,
    ) -> Result<(&'a str, &'a [String]), BootError> {
        let name = override_name.unwrap_or(default_name);
        self.templates
            .get(name)
            .map(|lines| (name, lines.as_slice()))
            .ok_or_else(|| BootError::MissingTemplate(name.to_owned()))
    }
}

const PLACEHOLDER: &str = r"\{[A-Z][A-Z0-9_]*\}";

/// Substitute every known placeholder in `lines` from `tags`.
///
/// Unknown `{...}` sequences are left untouched so bootloader variable
/// syntax such as `${loadaddr}` survives. A known placeholder without a value
/// is fatal.
pub fn render(name: &str, lines: &[String], tags: &TagMap) -> Result<Vec<String>, BootError> {
    let pattern = Regex::new(PLACEHOLDER).map_err(|err| BootError::Config(err.to_string()))?;
    lines
        .iter()
        .map(|line| {
            let mut out = String::with_capacity(line.len());
            let mut last = 0;
            for found in pattern.find_iter(line) {
                let token = found.as_str();
                if !tags::is_known_token(token) {
                    continue;
                }
                let value = tags.get(token).ok_or_else(|| BootError::UnresolvedPlaceholder {
                    template: name.to_owned(),
                    token: token.to_owned(),
                })?;
                out.push_str(&line[last..found.start()]);
                out.push_str(value);
                last = found.end();
            }
            out.push_str(&line[last..]);
            Ok(out)
        })
        .collect()
}

/// One console action derived from a rendered template line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootStep {
    /// Wait for the bootloader prompt, then send the line.
    Send(String),
    /// Send the line without waiting for a prompt.
    SendLine(String),
    /// Wait for the pattern.
    Expect(String),
}

impl BootStep {
    /// Classify a rendered line.
    #[must_use]
    pub fn parse(line: &str) -> Self {
        if let Some(rest) = line.strip_prefix(SENDLINE) {
            Self::SendLine(rest.to_owned())
        } else if let Some(rest) = line.strip_prefix(EXPECT) {
            Self::Expect(rest.to_owned())
        } else {
            Self::Send(line.to_owned())
        }
    }
}

/// Render a template and split it into console steps.
pub fn steps(name: &str, lines: &[String], tags: &TagMap) -> Result<Vec<BootStep>, BootError> {
    Ok(render(name, lines, tags)?
        .iter()
        .map(|line| BootStep::parse(line))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|line| (*line).to_owned()).collect()
    }

    #[test]
    fn substitutes_known_tokens_only() {
        let mut tags = TagMap::new();
        tags.insert(tags::SERVER_IP, "10.0.0.1");
        tags.insert(tags::KERNEL, "x/kernel/zImage");
        let rendered = render(
            RAMDISK_TEMPLATE,
            &lines(&[
                "setenv serverip {SERVER_IP}",
                "tftp ${loadaddr} {KERNEL}; echo {NOT_A_TAG}",
            ]),
            &tags,
        )
        .unwrap();
        assert_eq!(rendered[0], "setenv serverip 10.0.0.1");
        assert_eq!(rendered[1], "tftp ${loadaddr} x/kernel/zImage; echo {NOT_A_TAG}");
    }

    #[test]
    fn unresolved_known_token_is_fatal() {
        let tags = TagMap::new();
        let err = render(NFS_TEMPLATE, &lines(&["nfsroot={NFSROOTFS}"]), &tags).unwrap_err();
        match err {
            BootError::UnresolvedPlaceholder { template, token } => {
                assert_eq!(template, NFS_TEMPLATE);
                assert_eq!(token, "{NFSROOTFS}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn rendering_is_deterministic() {
        let mut tags = TagMap::new();
        tags.insert(tags::DTB, "d");
        tags.insert(tags::KERNEL, "k");
        tags.insert(tags::RAMDISK, "r");
        let template = lines(&["bootz {KERNEL} {RAMDISK} {DTB}", "{KERNEL}{KERNEL}"]);
        let first = render("t", &template, &tags).unwrap();
        for _ in 0..16 {
            assert_eq!(render("t", &template, &tags).unwrap(), first);
        }
        assert_eq!(first[1], "kk");
    }

    #[test]
    fn override_wins_and_missing_is_fatal() {
        let mut table = BTreeMap::new();
        table.insert(RAMDISK_TEMPLATE.to_owned(), lines(&["boot"]));
        table.insert("custom".to_owned(), lines(&["run custom"]));
        let templates = BootTemplates::new(table);
        assert_eq!(templates.select(None, RAMDISK_TEMPLATE).unwrap().0, RAMDISK_TEMPLATE);
        assert_eq!(templates.select(Some("custom"), RAMDISK_TEMPLATE).unwrap().0, "custom");
        assert!(matches!(
            templates.select(None, NFS_TEMPLATE),
            Err(BootError::MissingTemplate(name)) if name == NFS_TEMPLATE
        ));
    }

    #[test]
    fn parses_directives() {
        assert_eq!(BootStep::parse("bootm"), BootStep::Send("bootm".to_owned()));
        assert_eq!(
            BootStep::parse("sendline y"),
            BootStep::SendLine("y".to_owned())
        );
        assert_eq!(
            BootStep::parse("expect Loading kernel"),
            BootStep::Expect("Loading kernel".to_owned())
        );
    }
}
