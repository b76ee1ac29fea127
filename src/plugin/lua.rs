//! The `*lua` bot: `PRIVMSG *lua :<expression>`.
//!
//! Embedding a real Lua runtime is out of scope (see Non-goals); this
//! evaluates a small, deterministic arithmetic grammar — integers,
//! `+ - * /`, and parentheses — as a stand-in so the bot exists and
//! behaves predictably without pulling in a script engine.

use serde::Deserialize;
use serde_yaml::Value as YamlValue;

use super::{IrcPlugin, PluginHost};
use crate::error::{BouncerError, BouncerResult};
use crate::irc::IrcMessage;

pub const PLUGIN_NAME: &str = "lua";
pub const BOT_NICK: &str = "*lua";

#[derive(Debug, Default, Deserialize)]
struct Config {}

pub fn create(cfg: YamlValue) -> BouncerResult<std::sync::Arc<dyn IrcPlugin>> {
    let _: Config = serde_yaml::from_value(cfg)
        .map_err(|e| BouncerError::Plugin(format!("invalid {PLUGIN_NAME} config: {e}")))?;
    Ok(std::sync::Arc::new(Lua))
}

pub struct Lua;

impl IrcPlugin for Lua {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn init(&self, host: &dyn PluginHost) {
        host.add_relay_exception(BOT_NICK);
    }

    fn fini(&self, host: &dyn PluginHost) {
        host.remove_relay_exception(BOT_NICK);
    }

    fn on_event(&self, host: &dyn PluginHost, event: &str, msg: Option<&IrcMessage>, client_id: Option<u64>) {
        if event != "client_message" {
            return;
        }
        let Some(msg) = msg else { return };
        let Some(client_id) = client_id else { return };
        if msg.command != "PRIVMSG" {
            return;
        }
        let Some(target) = msg.params.first() else { return };
        if !target.eq_ignore_ascii_case(BOT_NICK) {
            return;
        }
        let Some(expr) = msg.trailing.as_deref() else { return };
        let nick = host.own_nick();
        match eval(expr) {
            Ok(value) => host.send_to_client(client_id, &format!(":{BOT_NICK} NOTICE {nick} :{value}")),
            Err(e) => host.send_to_client(client_id, &format!(":{BOT_NICK} NOTICE {nick} :error: {e}")),
        }
    }
}

/// Tokenizes and recursive-descent parses `+ - * / ( )` over integers.
fn eval(expr: &str) -> Result<i64, String> {
    let tokens = tokenize(expr)?;
    let mut pos = 0;
    let value = parse_expr(&tokens, &mut pos)?;
    if pos != tokens.len() {
        return Err("unexpected trailing input".to_string());
    }
    Ok(value)
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Num(i64),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(expr: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = expr.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            d if d.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: i64 = text.parse().map_err(|_| "invalid number".to_string())?;
                tokens.push(Token::Num(n));
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(tokens)
}

fn parse_expr(tokens: &[Token], pos: &mut usize) -> Result<i64, String> {
    let mut value = parse_term(tokens, pos)?;
    loop {
        match tokens.get(*pos) {
            Some(Token::Plus) => {
                *pos += 1;
                value += parse_term(tokens, pos)?;
            }
            Some(Token::Minus) => {
                *pos += 1;
                value -= parse_term(tokens, pos)?;
            }
            _ => break,
        }
    }
    Ok(value)
}

fn parse_term(tokens: &[Token], pos: &mut usize) -> Result<i64, String> {
    let mut value = parse_factor(tokens, pos)?;
    loop {
        match tokens.get(*pos) {
            Some(Token::Star) => {
                *pos += 1;
                value *= parse_factor(tokens, pos)?;
            }
            Some(Token::Slash) => {
                *pos += 1;
                let rhs = parse_factor(tokens, pos)?;
                if rhs == 0 {
                    return Err("division by zero".to_string());
                }
                value /= rhs;
            }
            _ => break,
        }
    }
    Ok(value)
}

fn parse_factor(tokens: &[Token], pos: &mut usize) -> Result<i64, String> {
    match tokens.get(*pos) {
        Some(Token::Num(n)) => {
            *pos += 1;
            Ok(*n)
        }
        Some(Token::Minus) => {
            *pos += 1;
            Ok(-parse_factor(tokens, pos)?)
        }
        Some(Token::LParen) => {
            *pos += 1;
            let value = parse_expr(tokens, pos)?;
            match tokens.get(*pos) {
                Some(Token::RParen) => {
                    *pos += 1;
                    Ok(value)
                }
                _ => Err("expected ')'".to_string()),
            }
        }
        _ => Err("expected a number".to_string()),
    }
}
