//! Static pattern tables.
//!
//! Everything here is compiled once and shared. Blocked rules are the only
//! non-overridable input to the gate; their `issue` strings are user-visible
//! and must stay stable.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::RateCategory;

/// A named regex with the issue text reported on match.
#[derive(Debug)]
pub struct Rule {
    pub id: &'static str,
    pub issue: &'static str,
    regex: Regex,
}

impl Rule {
    fn new(id: &'static str, issue: &'static str, pattern: &str) -> Self {
        Self {
            id,
            issue,
            regex: Regex::new(pattern).expect("static pattern should compile"),
        }
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }
}

fn rules(specs: &[(&'static str, &'static str, &str)]) -> Vec<Rule> {
    specs
        .iter()
        .map(|(id, issue, pattern)| Rule::new(id, issue, pattern))
        .collect()
}

// A recursive flag anywhere among the options: -r, -rf, -fR, --recursive.
const RM_RECURSIVE: &str = r"(?i)\brm\s+(?:--?[a-z-]+\s+)*-(?:[a-z]*r[a-z]*|-recursive)\s+(?:--?[a-z-]+\s+)*";
const CREDENTIAL_PATHS: &str =
    r"(?:/etc/shadow|\.ssh/id_\w+|\.aws/credentials|\.gnupg/|\.netrc|\.kube/config)";

// Target forms that name the same directory: quoted, doubled slashes, a
// trailing `/.` or a glob.
const TARGET_END: &str = r"['\x22]?/*\.?/*\*?['\x22]?(?:\s|;|&|\||$)";

static BLOCKED: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    let root_delete = format!(r"{RM_RECURSIVE}['\x22]?/{TARGET_END}");
    let home_delete =
        format!(r"{RM_RECURSIVE}['\x22]?(?:~|\$HOME|\$\{{HOME\}}){TARGET_END}");
    let home_tree_delete = format!(r"{RM_RECURSIVE}['\x22]?/+home{TARGET_END}");
    let exfil_push = format!(r"(?i)\b(?:curl|wget|nc|ncat|scp|rsync)\b[^\n]*{CREDENTIAL_PATHS}");
    let exfil_pipe =
        format!(r"(?i){CREDENTIAL_PATHS}[^\n|]*\|\s*(?:base64\s*\|\s*)?(?:curl|wget|nc|ncat)\b");
    let mut table = vec![
        Rule::new("root_delete", "recursive deletion of root", &root_delete),
        Rule::new(
            "home_delete",
            "recursive deletion of home directory",
            &home_delete,
        ),
        Rule::new(
            "home_tree_delete",
            "recursive deletion of /home",
            &home_tree_delete,
        ),
        Rule::new(
            "find_root_delete",
            "filesystem-wide deletion via find",
            r"(?i)\bfind\s+['\x22]?/+['\x22]?\s[^\n;|&]*(?:-delete\b|-exec\s+rm\b)",
        ),
        Rule::new("credential_exfil", "credential exfiltration", &exfil_push),
        Rule::new("credential_exfil_pipe", "credential exfiltration", &exfil_pipe),
    ];
    table.extend(rules(&[
        (
            "fork_bomb",
            "fork bomb",
            r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&",
        ),
        ("mkfs", "filesystem format", r"(?i)\bmkfs(?:\.\w+)?\b"),
        (
            "partition",
            "partition table manipulation",
            r"(?i)\b(?:fdisk|parted|gdisk|sfdisk|wipefs)\b",
        ),
        (
            "dd_device",
            "raw write to block device",
            r"(?i)\bdd\b[^|;&\n]*\bof=/dev/(?:sd|hd|vd|xvd|nvme|mmcblk)",
        ),
        (
            "redirect_device",
            "raw write to block device",
            r">\s*/dev/(?:sd[a-z]|hd[a-z]|vd[a-z]|xvd[a-z]|nvme\d|mmcblk\d)",
        ),
        (
            "chmod_root",
            "world-writable permissions on root",
            r"(?i)\bchmod\s+(?:-[a-z]+\s+)*(?:0?777|a\+rwx)\s+/(?:etc|usr|bin|sbin|boot|var|lib)?/?(?:\s|\*|;|$)",
        ),
        (
            "chown_root",
            "recursive ownership change of root",
            r"(?i)\bchown\s+(?:-[a-z]+\s+)*-[a-z]*R[a-z]*\s+\S+\s+/(?:\s|\*|;|$)",
        ),
        (
            "shadow_access",
            "shadow password file access",
            r"(?i)/etc/(?:shadow|gshadow)\b",
        ),
        (
            "auth_overwrite",
            "overwrite of authentication database",
            r">\s*/etc/(?:passwd|shadow|sudoers|group)\b",
        ),
        (
            "pipe_to_shell",
            "download piped to shell",
            r"(?i)\b(?:curl|wget)\b[^|;&\n]*\|\s*(?:sudo\s+)?(?:ba|z|k|da|fi)?sh\b",
        ),
        ("eval_expansion", "eval of expanded input", r"(?i)\beval\s+[^\n]*\$"),
    ]));
    table
});

static WARNINGS: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    rules(&[
        ("recursive_delete", "recursive deletion", r"(?i)\brm\s+(?:--?[a-z-]+\s+)*-(?:[a-z]*r[a-z]*|-recursive)\b"),
        ("privileged_delete", "privileged deletion", r"(?i)\bsudo\s+(?:rm|dd|shred)\b"),
        ("etc_write", "write under /etc", r">>?\s*/etc/"),
        ("crontab", "scheduled task modification", r"(?i)\bcrontab\s+-[er]\b"),
        ("service_stop", "service stop or disable", r"(?i)\bsystemctl\s+(?:stop|disable|mask)\b"),
        ("force_kill", "forced process kill", r"(?i)\b(?:kill\s+-9|killall|pkill)\b"),
        ("power", "reboot or shutdown", r"(?i)\b(?:reboot|shutdown|poweroff|halt)\b"),
        ("firewall", "firewall change", r"(?i)\b(?:iptables|nft|ufw|firewall-cmd)\b"),
        ("user_mgmt", "user account management", r"(?i)\b(?:useradd|userdel|usermod|passwd|groupadd)\b"),
        ("sudoers", "sudoers modification", r"(?i)\bvisudo\b|/etc/sudoers"),
        ("keygen", "key generation", r"(?i)\bssh-keygen\b"),
    ])
});

static SENSITIVE: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    rules(&[
        ("secret_words", "mentions secrets", r"(?i)\b(?:password|passwd|secret|token|api[_ -]?key|private[_ -]?key)\b"),
        ("dotenv", "environment secrets file", r"(?:^|[\s/])\.env\b"),
        ("ssh_dir", "ssh credentials directory", r"\.ssh/"),
        ("gnupg_dir", "gnupg keyring", r"\.gnupg/"),
        ("aws_dir", "aws credentials", r"\.aws/"),
        ("kube_dir", "kubernetes credentials", r"\.kube/"),
    ])
});

static SHELL_INJECTION: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    rules(&[
        ("backtick", "command substitution via backticks", r"`[^`]*`"),
        ("dollar_paren", "command substitution via $(...)", r"\$\("),
        ("chained_rm", "chained deletion after separator", r";\s*rm\s"),
        ("piped_rm", "deletion fed from a pipe", r"\|\s*rm\s"),
        ("etc_append", "append into /etc", r">>\s*/etc/"),
        ("device_redirect", "redirect into a raw device", r">\s*/dev/(?:sd|hd|vd|nvme|mem|kmem|port)"),
    ])
});

static PROMPT_INJECTION: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    rules(&[
        ("ignore_instructions", "asks to ignore prior instructions", r"(?i)\bignore\s+(?:all\s+|any\s+)?(?:the\s+)?(?:previous|prior|above|earlier)\s+(?:instructions|rules|prompts?)"),
        ("disregard_prompt", "asks to disregard the system prompt", r"(?i)\bdisregard\s+(?:the\s+|your\s+)?(?:system|previous)\s+(?:prompt|instructions)"),
        ("mode_switch", "attempts a mode switch", r"(?i)\byou\s+are\s+now\s+(?:in\s+)?(?:developer|dan|jailbreak|god)\b"),
        ("role_tag", "embeds a role tag", r"(?i)</?\s*(?:system|assistant)\s*>|\bsystem\s*prompt\s*:"),
        ("forged_reply", "embeds a forged classification reply", r#"(?i)"confident"\s*:\s*true"#),
    ])
});

static RATE_CATEGORIES: LazyLock<Vec<(RateCategory, Regex)>> = LazyLock::new(|| {
    [
        (RateCategory::Sudo, r"(?i)(?:^|[\s;&|(])(?:sudo|doas|pkexec)\s"),
        (
            RateCategory::Service,
            r"(?i)\b(?:systemctl|service|rc-service)\s+(?:\S+\s+)?(?:start|stop|restart|reload|enable|disable|mask|unmask)\b",
        ),
        (
            RateCategory::Container,
            r"(?i)\b(?:docker|podman|nerdctl)\s+(?:run|start|stop|rm|kill|exec|restart|pull|compose)\b",
        ),
        (
            RateCategory::Package,
            r"(?i)\b(?:apt|apt-get|dnf|yum|pacman|zypper|apk|brew|snap|flatpak|pip3?|npm|cargo)\s+(?:install|remove|purge|upgrade|update|uninstall|add|-S\w*|-R\w*)",
        ),
    ]
    .into_iter()
    .map(|(category, pattern)| {
        (
            category,
            Regex::new(pattern).expect("static pattern should compile"),
        )
    })
    .collect()
});

static ESCALATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:^|[\s;&|(])(?:sudo|doas|pkexec|su)(?:\s|$)")
        .expect("static pattern should compile")
});

static BROAD: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    rules(&[
        ("all_files", "affects all files", r"(?i)\b(?:all|every)\s+files?\b"),
        ("recursive", "recursive operation", r"(?i)\brecursive(?:ly)?\b|(?:^|\s)-[a-zA-Z]*[rR][a-zA-Z]*\b"),
        ("glob_star", "recursive glob", r"\*\*/"),
        ("wildcard", "wildcard target", r"(?:^|\s)\*(?:\s|$)"),
    ])
});

static SYSTEM_WIDE: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    rules(&[
        ("sudo", "runs with elevated privileges", r"(?i)(?:^|[\s;&|(])(?:sudo|doas|pkexec)\s"),
        ("system_dirs", "touches system directories", r"(?:^|[\s=])/(?:etc|usr|var|boot|lib|opt)(?:/|\s|$)"),
        ("systemctl", "changes system services", r"(?i)\bsystemctl\b"),
        ("package_manager", "changes installed packages", r"(?i)\b(?:apt|apt-get|dnf|yum|pacman|zypper)\b"),
    ])
});

static RESOURCE_HEAVY: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    rules(&[
        ("find_root", "walks the whole filesystem", r"(?i)\bfind\s+/(?:\s|$)"),
        ("grep_root", "searches the whole filesystem", r"(?i)\bgrep\s+-[a-zA-Z]*r[a-zA-Z]*\s+\S+\s+/(?:\s|$)"),
        ("dd", "bulk block copy", r"(?i)\bdd\b"),
        ("archive", "builds a compressed archive", r"(?i)\btar\s+-?[a-z]*c[a-z]*z"),
        ("rsync", "bulk file sync", r"(?i)\brsync\b"),
    ])
});

fn first_match<'a>(table: &'a [Rule], text: &str) -> Option<&'a Rule> {
    table.iter().find(|rule| rule.is_match(text))
}

fn all_matches<'a>(table: &'a [Rule], text: &str) -> Vec<&'a Rule> {
    table.iter().filter(|rule| rule.is_match(text)).collect()
}

/// First blocked rule matching `text`, if any.
pub fn blocked_match(text: &str) -> Option<&'static Rule> {
    first_match(&BLOCKED, text)
}

/// All blocked rules, in table order.
pub fn blocked_rules() -> &'static [Rule] {
    &BLOCKED
}

pub fn warning_matches(text: &str) -> Vec<&'static Rule> {
    all_matches(&WARNINGS, text)
}

pub fn sensitive_matches(text: &str) -> Vec<&'static Rule> {
    all_matches(&SENSITIVE, text)
}

pub fn shell_injection_matches(text: &str) -> Vec<&'static Rule> {
    all_matches(&SHELL_INJECTION, text)
}

/// Ids of prompt-injection signatures present in `text`.
pub fn prompt_injection_signatures(text: &str) -> Vec<&'static str> {
    all_matches(&PROMPT_INJECTION, text)
        .into_iter()
        .map(|rule| rule.id)
        .collect()
}

pub fn broad_matches(text: &str) -> Vec<&'static Rule> {
    all_matches(&BROAD, text)
}

pub fn system_wide_matches(text: &str) -> Vec<&'static Rule> {
    all_matches(&SYSTEM_WIDE, text)
}

pub fn resource_heavy_matches(text: &str) -> Vec<&'static Rule> {
    all_matches(&RESOURCE_HEAVY, text)
}

/// Rate categories charged by executing `text`, in category order.
///
/// `Approval` is never derived from content; it is charged on confirmation.
pub fn rate_categories(text: &str) -> Vec<RateCategory> {
    RATE_CATEGORIES
        .iter()
        .filter(|(_, regex)| regex.is_match(text))
        .map(|(category, _)| *category)
        .collect()
}

pub fn is_privilege_escalation(text: &str) -> bool {
    ESCALATION.is_match(text)
}

/// Escalates, charges a rate category, or trips a warning rule.
pub fn changes_system_state(text: &str) -> bool {
    is_privilege_escalation(text)
        || !rate_categories(text).is_empty()
        || WARNINGS.iter().any(|rule| rule.is_match(text))
}
