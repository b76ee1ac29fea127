//! IRC message grammar (spec.md §4.3), informally per RFC 1459:
//!
//! ```text
//! message  = [ ":" prefix SPACE ] command { SPACE param } [ SPACE ":" trailing ] CRLF
//! param    = non-space, non-colon token
//! ```
//!
//! Parsing never panics on malformed input; it returns `None` and the
//! caller drops the line (spec.md §7, parse failure).

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IrcMessage {
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
    pub trailing: Option<String>,
    pub raw: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IrcUserMask {
    pub nick: String,
    pub user: Option<String>,
    pub host: Option<String>,
}

/// Parses a single raw line (CR/LF already stripped by the framing layer)
/// into an [`IrcMessage`]. Returns `None` if the line starts with `:` but
/// has no following space (the only case the original grammar treats as
/// fatally malformed).
pub fn parse_message(line: &str) -> Option<IrcMessage> {
    let raw = line.to_string();

    let (prefix, rest) = if let Some(stripped) = line.strip_prefix(':') {
        match stripped.find(' ') {
            Some(space_idx) => (Some(stripped[..space_idx].to_string()), &stripped[space_idx..]),
            None => return None,
        }
    } else {
        (None, line)
    };

    let rest = rest.trim_start();
    let (command, after_command) = match rest.find(' ') {
        Some(idx) => (rest[..idx].to_string(), &rest[idx..]),
        None => {
            return Some(IrcMessage {
                prefix,
                command: rest.to_string(),
                params: Vec::new(),
                trailing: None,
                raw,
            });
        }
    };

    let (params, trailing) = match after_command.find(':') {
        None => {
            let params_text = after_command.trim();
            (split_params(params_text), None)
        }
        Some(colon_idx) => {
            let trailing = Some(after_command[colon_idx + 1..].to_string());
            let params_text_len = colon_idx.saturating_sub(1);
            let params = if colon_idx >= 2 {
                split_params(after_command[..params_text_len].trim())
            } else {
                Vec::new()
            };
            (params, trailing)
        }
    };

    Some(IrcMessage {
        prefix,
        command,
        params,
        trailing,
        raw,
    })
}

fn split_params(text: &str) -> Vec<String> {
    if text.is_empty() {
        Vec::new()
    } else {
        text.split_whitespace().map(|s| s.to_string()).collect()
    }
}

/// Formats a message back into wire form, inverse of [`parse_message`] for
/// any message producible by this function.
pub fn format_message(prefix: Option<&str>, command: &str, params: &[String], trailing: Option<&str>) -> String {
    let mut out = String::new();
    if let Some(p) = prefix {
        out.push(':');
        out.push_str(p);
        out.push(' ');
    }
    out.push_str(command);
    for param in params {
        out.push(' ');
        out.push_str(param);
    }
    if let Some(t) = trailing {
        out.push_str(" :");
        out.push_str(t);
    }
    out
}

/// Parses the prefix part of a message into nick/user/host, splitting at
/// the first `!` and first `@` (spec.md §4.3). A failed parse (null
/// prefix) returns `None` and must never panic.
pub fn parse_user_mask(prefix: &str) -> Option<IrcUserMask> {
    let bang = prefix.find('!');
    let at = prefix.find('@');

    match (bang, at) {
        (None, None) => Some(IrcUserMask {
            nick: prefix.to_string(),
            user: None,
            host: None,
        }),
        (Some(b), Some(a)) if a > b => Some(IrcUserMask {
            nick: prefix[..b].to_string(),
            user: Some(prefix[b + 1..a].to_string()),
            host: Some(prefix[a + 1..].to_string()),
        }),
        (Some(b), _) => Some(IrcUserMask {
            nick: prefix[..b].to_string(),
            user: Some(prefix[b + 1..].to_string()),
            host: None,
        }),
        (None, Some(a)) => Some(IrcUserMask {
            nick: prefix[..a].to_string(),
            user: None,
            host: Some(prefix[a + 1..].to_string()),
        }),
    }
}

pub fn format_user_mask(mask: &IrcUserMask) -> String {
    let mut out = mask.nick.clone();
    if let Some(user) = &mask.user {
        out.push('!');
        out.push_str(user);
    }
    if let Some(host) = &mask.host {
        out.push('@');
        out.push_str(host);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_prefix_command_params_trailing() {
        let msg = parse_message(":nick!user@host PRIVMSG #chan :hello world").unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("nick!user@host"));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#chan".to_string()]);
        assert_eq!(msg.trailing.as_deref(), Some("hello world"));
    }

    #[test]
    fn parses_command_only() {
        let msg = parse_message("QUIT").unwrap();
        assert_eq!(msg.prefix, None);
        assert_eq!(msg.command, "QUIT");
        assert!(msg.params.is_empty());
        assert_eq!(msg.trailing, None);
    }

    #[test]
    fn malformed_prefix_without_space_is_rejected() {
        assert!(parse_message(":nobody-with-a-command").is_none());
    }

    #[test]
    fn collapses_whitespace_runs_in_params() {
        let msg = parse_message("MODE   #chan   +o   nick").unwrap();
        assert_eq!(msg.params, vec!["#chan", "+o", "nick"]);
    }

    #[test]
    fn trailing_only_no_params() {
        let msg = parse_message("PRIVMSG :hello").unwrap();
        assert!(msg.params.is_empty());
        assert_eq!(msg.trailing.as_deref(), Some("hello"));
    }

    #[test]
    fn trailing_can_contain_colons_and_spaces() {
        let msg = parse_message("PRIVMSG #chan :a: b : c").unwrap();
        assert_eq!(msg.trailing.as_deref(), Some("a: b : c"));
    }

    #[test]
    fn round_trip_through_format() {
        let raw = format_message(
            Some("nick!user@host"),
            "PRIVMSG",
            &["#chan".to_string()],
            Some("hello world"),
        );
        let reparsed = parse_message(&raw).unwrap();
        assert_eq!(reparsed.prefix.as_deref(), Some("nick!user@host"));
        assert_eq!(reparsed.command, "PRIVMSG");
        assert_eq!(reparsed.params, vec!["#chan".to_string()]);
        assert_eq!(reparsed.trailing.as_deref(), Some("hello world"));
    }

    #[test]
    fn reparsing_raw_is_stable() {
        let msg = parse_message(":a!b@c JOIN #chan").unwrap();
        let reparsed = parse_message(&msg.raw).unwrap();
        assert_eq!(msg, reparsed);
    }

    #[test]
    fn user_mask_variants() {
        assert_eq!(
            parse_user_mask("nick"),
            Some(IrcUserMask {
                nick: "nick".into(),
                user: None,
                host: None
            })
        );
        assert_eq!(
            parse_user_mask("nick!user@host"),
            Some(IrcUserMask {
                nick: "nick".into(),
                user: Some("user".into()),
                host: Some("host".into())
            })
        );
        assert_eq!(
            parse_user_mask("nick!user"),
            Some(IrcUserMask {
                nick: "nick".into(),
                user: Some("user".into()),
                host: None
            })
        );
        assert_eq!(
            parse_user_mask("nick@host"),
            Some(IrcUserMask {
                nick: "nick".into(),
                user: None,
                host: Some("host".into())
            })
        );
    }

    #[test]
    fn user_mask_round_trip() {
        let mask = IrcUserMask {
            nick: "bob".into(),
            user: Some("~u".into()),
            host: Some("h".into()),
        };
        assert_eq!(parse_user_mask(&format_user_mask(&mask)), Some(mask));
    }

    #[test]
    fn utf8_trailing_is_preserved_unchanged() {
        let msg = parse_message("PRIVMSG #chan :héllo wörld 🎉").unwrap();
        assert_eq!(msg.trailing.as_deref(), Some("héllo wörld 🎉"));
    }
}
