//! Shader source tokenizer.

use crate::error::{Result, TslError};

#[derive(Clone, Debug, PartialEq)]
pub enum Token {
  // keywords
  Struct,
  Shader,
  In,
  Out,
  If,
  Else,
  While,
  Do,
  For,
  Return,
  Break,
  Continue,
  MakeClosure,
  /// Any type keyword; the spelling is kept so `vector` and `color` can be told apart in diagnostics.
  TypeName(String),

  // literals
  IntLit(i32),
  FloatLit(f32),
  DoubleLit(f64),
  BoolLit(bool),

  Ident(String),

  // operators
  Plus,
  Minus,
  Star,
  Slash,
  Percent,
  Amp,
  Pipe,
  Caret,
  Tilde,
  Bang,
  Shl,
  Shr,
  AndAnd,
  OrOr,
  Eq,
  EqEq,
  NotEq,
  Lt,
  Le,
  Gt,
  Ge,
  PlusEq,
  MinusEq,
  StarEq,
  SlashEq,
  PlusPlus,
  MinusMinus,
  Question,
  Colon,

  // punctuation
  LParen,
  RParen,
  LBrace,
  RBrace,
  Comma,
  Semicolon,
  Dot,

  Eof,
}

/// Token with the position of its first character, both 1-based.
#[derive(Clone, Debug, PartialEq)]
pub struct Spanned {
  pub token: Token,
  pub line: usize,
  pub column: usize,
}

const TYPE_KEYWORDS: &[&str] = &[
  "void", "bool", "int", "float", "double", "float3", "vector", "color", "normal", "point", "float4",
  "closure",
];

struct Lexer<'a> {
  bytes: &'a [u8],
  pos: usize,
  line: usize,
  column: usize,
}

impl<'a> Lexer<'a> {
  fn peek(&self, offset: usize) -> Option<u8> {
    self.bytes.get(self.pos + offset).copied()
  }

  fn bump(&mut self) -> Option<u8> {
    let b = self.peek(0)?;
    self.pos += 1;

    if b == b'\n' {
      self.line += 1;
      self.column = 1;
    } else {
      self.column += 1;
    }

    Some(b)
  }

  fn error(&self, message: impl Into<String>) -> TslError {
    TslError::Syntax {
      line: self.line,
      column: self.column,
      message: message.into(),
    }
  }

  fn skip_trivia(&mut self) -> Result<()> {
    loop {
      match (self.peek(0), self.peek(1)) {
        (Some(b), _) if b.is_ascii_whitespace() => {
          self.bump();
        }

        (Some(b'/'), Some(b'/')) => {
          while self.peek(0).is_some_and(|b| b != b'\n') {
            self.bump();
          }
        }

        (Some(b'/'), Some(b'*')) => {
          let (line, column) = (self.line, self.column);
          self.bump();
          self.bump();

          loop {
            match (self.peek(0), self.peek(1)) {
              (Some(b'*'), Some(b'/')) => {
                self.bump();
                self.bump();
                break;
              }

              (Some(_), _) => {
                self.bump();
              }

              (None, _) => {
                return Err(TslError::Syntax {
                  line,
                  column,
                  message: "unterminated block comment".to_owned(),
                })
              }
            }
          }
        }

        _ => return Ok(()),
      }
    }
  }

  fn number(&mut self) -> Result<Token> {
    let start = self.pos;
    let mut is_float = false;

    while let Some(b) = self.peek(0) {
      if b.is_ascii_digit() {
        self.bump();
      } else if b == b'.' && !is_float {
        is_float = true;
        self.bump();
      } else {
        break;
      }
    }

    if matches!(self.peek(0), Some(b'e' | b'E')) {
      let sign = usize::from(matches!(self.peek(1), Some(b'+' | b'-')));

      if self.peek(1 + sign).is_some_and(|b| b.is_ascii_digit()) {
        is_float = true;

        for _ in 0..=sign {
          self.bump();
        }

        while self.peek(0).is_some_and(|b| b.is_ascii_digit()) {
          self.bump();
        }
      }
    }

    let mut text = String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned();
    if text.starts_with('.') {
      text.insert(0, '0');
    }

    let token = match self.peek(0) {
      Some(b'f' | b'F') => {
        self.bump();
        text.parse().map(Token::FloatLit).ok()
      }

      Some(b'd' | b'D') => {
        self.bump();
        text.parse().map(Token::DoubleLit).ok()
      }

      _ if is_float => text.parse().map(Token::FloatLit).ok(),
      _ => text.parse().map(Token::IntLit).ok(),
    };

    token.ok_or_else(|| self.error(format!("invalid number literal {}", text)))
  }

  fn word(&mut self) -> Token {
    let start = self.pos;

    while self
      .peek(0)
      .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_')
    {
      self.bump();
    }

    let word = String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned();

    match word.as_str() {
      "struct" => Token::Struct,
      "shader" => Token::Shader,
      "in" => Token::In,
      "out" => Token::Out,
      "if" => Token::If,
      "else" => Token::Else,
      "while" => Token::While,
      "do" => Token::Do,
      "for" => Token::For,
      "return" => Token::Return,
      "break" => Token::Break,
      "continue" => Token::Continue,
      "make_closure" => Token::MakeClosure,
      "true" => Token::BoolLit(true),
      "false" => Token::BoolLit(false),
      w if TYPE_KEYWORDS.contains(&w) => Token::TypeName(word),
      _ => Token::Ident(word),
    }
  }

  fn punct(&mut self) -> Result<Token> {
    let two = match (self.peek(0), self.peek(1)) {
      (Some(b'<'), Some(b'<')) => Some(Token::Shl),
      (Some(b'>'), Some(b'>')) => Some(Token::Shr),
      (Some(b'&'), Some(b'&')) => Some(Token::AndAnd),
      (Some(b'|'), Some(b'|')) => Some(Token::OrOr),
      (Some(b'='), Some(b'=')) => Some(Token::EqEq),
      (Some(b'!'), Some(b'=')) => Some(Token::NotEq),
      (Some(b'<'), Some(b'=')) => Some(Token::Le),
      (Some(b'>'), Some(b'=')) => Some(Token::Ge),
      (Some(b'+'), Some(b'=')) => Some(Token::PlusEq),
      (Some(b'-'), Some(b'=')) => Some(Token::MinusEq),
      (Some(b'*'), Some(b'=')) => Some(Token::StarEq),
      (Some(b'/'), Some(b'=')) => Some(Token::SlashEq),
      (Some(b'+'), Some(b'+')) => Some(Token::PlusPlus),
      (Some(b'-'), Some(b'-')) => Some(Token::MinusMinus),
      _ => None,
    };

    if let Some(token) = two {
      self.bump();
      self.bump();
      return Ok(token);
    }

    let token = match self.peek(0) {
      Some(b'+') => Token::Plus,
      Some(b'-') => Token::Minus,
      Some(b'*') => Token::Star,
      Some(b'/') => Token::Slash,
      Some(b'%') => Token::Percent,
      Some(b'&') => Token::Amp,
      Some(b'|') => Token::Pipe,
      Some(b'^') => Token::Caret,
      Some(b'~') => Token::Tilde,
      Some(b'!') => Token::Bang,
      Some(b'=') => Token::Eq,
      Some(b'<') => Token::Lt,
      Some(b'>') => Token::Gt,
      Some(b'?') => Token::Question,
      Some(b':') => Token::Colon,
      Some(b'(') => Token::LParen,
      Some(b')') => Token::RParen,
      Some(b'{') => Token::LBrace,
      Some(b'}') => Token::RBrace,
      Some(b',') => Token::Comma,
      Some(b';') => Token::Semicolon,
      Some(b'.') => Token::Dot,
      Some(b) => return Err(self.error(format!("unexpected character {:?}", b as char))),
      None => Token::Eof,
    };

    self.bump();
    Ok(token)
  }
}

/// Split source text into tokens. The last token is always [`Token::Eof`].
pub fn tokenize(source: &str) -> Result<Vec<Spanned>> {
  let mut lexer = Lexer {
    bytes: source.as_bytes(),
    pos: 0,
    line: 1,
    column: 1,
  };
  let mut tokens = Vec::new();

  loop {
    lexer.skip_trivia()?;
    let (line, column) = (lexer.line, lexer.column);

    let token = match lexer.peek(0) {
      None => Token::Eof,
      Some(b) if b.is_ascii_digit() => lexer.number()?,
      Some(b'.') if lexer.peek(1).is_some_and(|b| b.is_ascii_digit()) => lexer.number()?,
      Some(b) if b.is_ascii_alphabetic() || b == b'_' => lexer.word(),
      Some(_) => lexer.punct()?,
    };

    let eof = token == Token::Eof;
    tokens.push(Spanned {
      token,
      line,
      column,
    });

    if eof {
      return Ok(tokens);
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;

  fn tokens(src: &str) -> Vec<Token> {
    tokenize(src)
      .unwrap()
      .into_iter()
      .map(|s| s.token)
      .collect()
  }

  #[test]
  fn literals() {
    assert_eq!(
      tokens("1 1.0 1.0f 2.5d .5 3e2"),
      vec![
        Token::IntLit(1),
        Token::FloatLit(1.),
        Token::FloatLit(1.),
        Token::DoubleLit(2.5),
        Token::FloatLit(0.5),
        Token::FloatLit(300.),
        Token::Eof
      ]
    );
  }

  #[test]
  fn comments_and_operators() {
    assert_eq!(
      tokens("a += b /* x */ << 2; // done\n!c"),
      vec![
        Token::Ident("a".to_owned()),
        Token::PlusEq,
        Token::Ident("b".to_owned()),
        Token::Shl,
        Token::IntLit(2),
        Token::Semicolon,
        Token::Bang,
        Token::Ident("c".to_owned()),
        Token::Eof
      ]
    );
  }

  #[test]
  fn keywords_and_types() {
    assert_eq!(
      tokens("shader make_closure color Lambert"),
      vec![
        Token::Shader,
        Token::MakeClosure,
        Token::TypeName("color".to_owned()),
        Token::Ident("Lambert".to_owned()),
        Token::Eof
      ]
    );
  }

  #[test]
  fn positions() {
    let t = tokenize("a\n  @").unwrap_err();
    assert_eq!(
      t,
      TslError::Syntax {
        line: 2,
        column: 3,
        message: "unexpected character '@'".to_owned()
      }
    );

    assert!(matches!(
      tokenize("/* open"),
      Err(TslError::Syntax { line: 1, column: 1, .. })
    ));
  }
}
