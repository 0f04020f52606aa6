//! Recursive-descent parser.
//!
//! Turns shader source into a [`ParsedProgram`]. Any error aborts parsing and is reported with the position of the
//! offending token; no partial program is returned.

use crate::{
  ast::{AssignOp, Expr, FunctionDecl, Param, ParsedProgram, Stmt, StructDecl},
  error::{Result, TslError},
  lexer::{tokenize, Spanned, Token},
  types::Type,
};
use std::collections::{BTreeSet, HashSet};

/// Parse a whole shader source.
pub fn parse(source: &str) -> Result<ParsedProgram> {
  let tokens = tokenize(source)?;
  let mut p = Parser {
    tokens,
    pos: 0,
    structs: HashSet::new(),
    closures: BTreeSet::new(),
    depth: 0,
  };

  p.program()
}

static EOF: Token = Token::Eof;

// Deepest nesting of statements and expressions accepted. Every later stage walks the tree recursively.
const MAX_NESTING: usize = 128;

// Number of binary precedence levels, from `||` (0) to `*` (9).
const BINARY_LEVELS: usize = 10;

fn binary_op(level: usize, token: &Token) -> Option<fn(Box<Expr>, Box<Expr>) -> Expr> {
  let op: fn(Box<Expr>, Box<Expr>) -> Expr = match (level, token) {
    (0, Token::OrOr) => Expr::Or,
    (1, Token::AndAnd) => Expr::And,
    (2, Token::Pipe) => Expr::BitOr,
    (3, Token::Caret) => Expr::BitXor,
    (4, Token::Amp) => Expr::BitAnd,
    (5, Token::EqEq) => Expr::Eq,
    (5, Token::NotEq) => Expr::Neq,
    (6, Token::Lt) => Expr::Lt,
    (6, Token::Le) => Expr::Lte,
    (6, Token::Gt) => Expr::Gt,
    (6, Token::Ge) => Expr::Gte,
    (7, Token::Shl) => Expr::Shl,
    (7, Token::Shr) => Expr::Shr,
    (8, Token::Plus) => Expr::Add,
    (8, Token::Minus) => Expr::Sub,
    (9, Token::Star) => Expr::Mul,
    (9, Token::Slash) => Expr::Div,
    (9, Token::Percent) => Expr::Rem,
    _ => return None,
  };

  Some(op)
}

fn assign_op(token: &Token) -> Option<AssignOp> {
  match token {
    Token::Eq => Some(AssignOp::Set),
    Token::PlusEq => Some(AssignOp::Add),
    Token::MinusEq => Some(AssignOp::Sub),
    Token::StarEq => Some(AssignOp::Mul),
    Token::SlashEq => Some(AssignOp::Div),
    _ => None,
  }
}

struct Parser {
  tokens: Vec<Spanned>,
  pos: usize,
  // structure names declared so far, needed to recognize declarations
  structs: HashSet<String>,
  closures: BTreeSet<String>,
  depth: usize,
}

impl Parser {
  fn peek(&self) -> &Token {
    self.peek_at(0)
  }

  fn peek_at(&self, offset: usize) -> &Token {
    self
      .tokens
      .get(self.pos + offset)
      .or(self.tokens.last())
      .map(|s| &s.token)
      .unwrap_or(&EOF)
  }

  fn advance(&mut self) -> Token {
    let token = self.peek().clone();

    if self.pos < self.tokens.len() {
      self.pos += 1;
    }

    token
  }

  fn eat(&mut self, token: &Token) -> bool {
    if self.peek() == token {
      self.advance();
      true
    } else {
      false
    }
  }

  fn error(&self, message: impl Into<String>) -> TslError {
    let (line, column) = self
      .tokens
      .get(self.pos)
      .or(self.tokens.last())
      .map(|s| (s.line, s.column))
      .unwrap_or((1, 1));

    TslError::Syntax {
      line,
      column,
      message: message.into(),
    }
  }

  // Go one nesting level deeper; the caller restores the depth when it is done.
  fn deepen(&mut self) -> Result<()> {
    if self.depth >= MAX_NESTING {
      return Err(self.error("statement or expression nested too deeply"));
    }

    self.depth += 1;
    Ok(())
  }

  // Run `f` one nesting level deeper.
  fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
    self.deepen()?;
    let r = f(self);
    self.depth -= 1;
    r
  }

  fn expect(&mut self, token: &Token) -> Result<()> {
    if self.eat(token) {
      Ok(())
    } else {
      Err(self.error(format!("expected {:?}, found {:?}", token, self.peek())))
    }
  }

  fn expect_ident(&mut self) -> Result<String> {
    match self.peek() {
      Token::Ident(name) => {
        let name = name.clone();
        self.advance();
        Ok(name)
      }
      t => Err(self.error(format!("expected identifier, found {:?}", t))),
    }
  }

  /// Whether the token at `offset` starts a type.
  fn is_type_at(&self, offset: usize) -> bool {
    match self.peek_at(offset) {
      Token::TypeName(_) => true,
      Token::Ident(name) => self.structs.contains(name),
      _ => false,
    }
  }

  fn ty(&mut self) -> Result<Type> {
    let ty = match self.peek() {
      Token::TypeName(kw) => Type::from_keyword(kw),
      Token::Ident(name) if self.structs.contains(name) => Some(Type::Struct(name.clone())),
      _ => None,
    };

    match ty {
      Some(ty) => {
        self.advance();
        Ok(ty)
      }
      None => Err(self.error(format!("expected a type, found {:?}", self.peek()))),
    }
  }

  fn program(&mut self) -> Result<ParsedProgram> {
    let mut program = ParsedProgram::default();

    loop {
      match self.peek() {
        Token::Eof => break,

        Token::Struct => {
          let decl = self.struct_decl()?;
          program.structures.push(decl);
        }

        Token::Shader => {
          if program.shader.is_some() {
            return Err(self.error("only one shader entry is allowed per source"));
          }

          self.advance();
          let name = self.expect_ident()?;
          let params = self.params()?;
          let body = self.block()?;

          program.shader = Some(FunctionDecl {
            name,
            ret: Type::Void,
            params,
            body: Some(body),
            is_shader: true,
          });
        }

        _ => {
          let decl = self.function()?;
          program.functions.push(decl);
        }
      }
    }

    program.closures = std::mem::take(&mut self.closures);
    Ok(program)
  }

  fn struct_decl(&mut self) -> Result<StructDecl> {
    self.expect(&Token::Struct)?;
    let name = self.expect_ident()?;
    self.expect(&Token::LBrace)?;

    let mut fields = Vec::new();
    while !self.eat(&Token::RBrace) {
      let ty = self.ty()?;

      loop {
        let field = self.expect_ident()?;
        if fields.iter().any(|(f, _)| *f == field) {
          return Err(self.error(format!("field {} declared twice in {}", field, name)));
        }

        fields.push((field, ty.clone()));

        if !self.eat(&Token::Comma) {
          break;
        }
      }

      self.expect(&Token::Semicolon)?;
    }

    self.eat(&Token::Semicolon);
    self.structs.insert(name.clone());

    Ok(StructDecl { name, fields })
  }

  fn function(&mut self) -> Result<FunctionDecl> {
    let ret = self.ty()?;
    let name = self.expect_ident()?;
    let params = self.params()?;

    let body = if self.eat(&Token::Semicolon) {
      None
    } else {
      Some(self.block()?)
    };

    Ok(FunctionDecl {
      name,
      ret,
      params,
      body,
      is_shader: false,
    })
  }

  fn params(&mut self) -> Result<Vec<Param>> {
    self.expect(&Token::LParen)?;
    let mut params = Vec::new();

    if self.eat(&Token::RParen) {
      return Ok(params);
    }

    loop {
      let is_output = if self.eat(&Token::Out) {
        true
      } else {
        self.eat(&Token::In);
        false
      };

      let ty = self.ty()?;
      let name = self.expect_ident()?;
      params.push(Param {
        name,
        ty,
        is_output,
      });

      if !self.eat(&Token::Comma) {
        break;
      }
    }

    self.expect(&Token::RParen)?;
    Ok(params)
  }

  fn block(&mut self) -> Result<Vec<Stmt>> {
    self.expect(&Token::LBrace)?;
    let mut stmts = Vec::new();

    while !self.eat(&Token::RBrace) {
      if *self.peek() == Token::Eof {
        return Err(self.error("unexpected end of input, expected }"));
      }

      stmts.push(self.stmt()?);
    }

    Ok(stmts)
  }

  fn stmt(&mut self) -> Result<Stmt> {
    self.nested(Self::stmt_inner)
  }

  fn stmt_inner(&mut self) -> Result<Stmt> {
    match self.peek() {
      Token::LBrace => Ok(Stmt::Block(self.block()?)),

      Token::Semicolon => {
        self.advance();
        Ok(Stmt::Block(Vec::new()))
      }

      Token::If => {
        self.advance();
        self.expect(&Token::LParen)?;
        let cond = self.expr()?;
        self.expect(&Token::RParen)?;
        let then_branch = Box::new(self.stmt()?);
        let else_branch = if self.eat(&Token::Else) {
          Some(Box::new(self.stmt()?))
        } else {
          None
        };

        Ok(Stmt::If {
          cond,
          then_branch,
          else_branch,
        })
      }

      Token::While => {
        self.advance();
        self.expect(&Token::LParen)?;
        let cond = self.expr()?;
        self.expect(&Token::RParen)?;
        let body = Box::new(self.stmt()?);

        Ok(Stmt::While { cond, body })
      }

      Token::Do => {
        self.advance();
        let body = Box::new(self.stmt()?);
        self.expect(&Token::While)?;
        self.expect(&Token::LParen)?;
        let cond = self.expr()?;
        self.expect(&Token::RParen)?;
        self.expect(&Token::Semicolon)?;

        Ok(Stmt::DoWhile { body, cond })
      }

      Token::For => {
        self.advance();
        self.expect(&Token::LParen)?;

        let init = if self.eat(&Token::Semicolon) {
          None
        } else if self.is_type_at(0) {
          Some(Box::new(self.var_decl()?))
        } else {
          let e = self.expr()?;
          self.expect(&Token::Semicolon)?;
          Some(Box::new(Stmt::Expr(e)))
        };

        let cond = if *self.peek() == Token::Semicolon {
          None
        } else {
          Some(self.expr()?)
        };
        self.expect(&Token::Semicolon)?;

        let step = if *self.peek() == Token::RParen {
          None
        } else {
          Some(self.expr()?)
        };
        self.expect(&Token::RParen)?;

        let body = Box::new(self.stmt()?);

        Ok(Stmt::For {
          init,
          cond,
          step,
          body,
        })
      }

      Token::Return => {
        self.advance();
        let value = if *self.peek() == Token::Semicolon {
          None
        } else {
          Some(self.expr()?)
        };
        self.expect(&Token::Semicolon)?;

        Ok(Stmt::Return(value))
      }

      Token::Break => {
        self.advance();
        self.expect(&Token::Semicolon)?;
        Ok(Stmt::Break)
      }

      Token::Continue => {
        self.advance();
        self.expect(&Token::Semicolon)?;
        Ok(Stmt::Continue)
      }

      _ if self.is_type_at(0) && matches!(self.peek_at(1), Token::Ident(_)) => self.var_decl(),

      _ => {
        let e = self.expr()?;
        self.expect(&Token::Semicolon)?;
        Ok(Stmt::Expr(e))
      }
    }
  }

  fn var_decl(&mut self) -> Result<Stmt> {
    let ty = self.ty()?;
    let mut vars = Vec::new();

    loop {
      let name = self.expect_ident()?;
      let init = if self.eat(&Token::Eq) {
        Some(self.assignment()?)
      } else {
        None
      };
      vars.push((name, init));

      if !self.eat(&Token::Comma) {
        break;
      }
    }

    self.expect(&Token::Semicolon)?;
    Ok(Stmt::VarDecl { ty, vars })
  }

  fn expr(&mut self) -> Result<Expr> {
    self.assignment()
  }

  fn assignment(&mut self) -> Result<Expr> {
    self.nested(Self::assignment_inner)
  }

  fn assignment_inner(&mut self) -> Result<Expr> {
    let target = self.ternary()?;

    match assign_op(self.peek()) {
      Some(op) => {
        self.advance();
        let value = self.assignment()?;

        Ok(Expr::Assign {
          op,
          target: Box::new(target),
          value: Box::new(value),
        })
      }

      None => Ok(target),
    }
  }

  fn ternary(&mut self) -> Result<Expr> {
    self.nested(Self::ternary_inner)
  }

  fn ternary_inner(&mut self) -> Result<Expr> {
    let cond = self.binary(0)?;

    if !self.eat(&Token::Question) {
      return Ok(cond);
    }

    let a = self.assignment()?;
    self.expect(&Token::Colon)?;
    let b = self.ternary()?;

    Ok(Expr::Ternary(Box::new(cond), Box::new(a), Box::new(b)))
  }

  fn binary(&mut self, level: usize) -> Result<Expr> {
    if level == BINARY_LEVELS {
      return self.unary();
    }

    let mut lhs = self.binary(level + 1)?;
    let depth = self.depth;

    // each operator of a chain deepens the left operand
    while let Some(op) = binary_op(level, self.peek()) {
      self.deepen()?;
      self.advance();
      let rhs = self.binary(level + 1)?;
      lhs = op(Box::new(lhs), Box::new(rhs));
    }

    self.depth = depth;
    Ok(lhs)
  }

  fn unary(&mut self) -> Result<Expr> {
    self.nested(Self::unary_inner)
  }

  fn unary_inner(&mut self) -> Result<Expr> {
    match self.peek() {
      Token::Minus => {
        self.advance();
        Ok(Expr::Neg(Box::new(self.unary()?)))
      }

      Token::Plus => {
        self.advance();
        self.unary()
      }

      Token::Bang => {
        self.advance();
        Ok(Expr::Not(Box::new(self.unary()?)))
      }

      Token::Tilde => {
        self.advance();
        Ok(Expr::BitNot(Box::new(self.unary()?)))
      }

      Token::PlusPlus | Token::MinusMinus => {
        let increment = self.advance() == Token::PlusPlus;
        let target = Box::new(self.unary()?);

        Ok(Expr::IncDec {
          increment,
          prefix: true,
          target,
        })
      }

      _ => self.postfix(),
    }
  }

  fn postfix(&mut self) -> Result<Expr> {
    let mut e = self.primary()?;
    let depth = self.depth;

    loop {
      match self.peek() {
        Token::Dot => {
          self.deepen()?;
          self.advance();
          let field = self.expect_ident()?;
          e = Expr::Field(Box::new(e), field);
        }

        Token::PlusPlus | Token::MinusMinus => {
          self.deepen()?;
          let increment = self.advance() == Token::PlusPlus;

          e = Expr::IncDec {
            increment,
            prefix: false,
            target: Box::new(e),
          };
        }

        _ => {
          self.depth = depth;
          return Ok(e);
        }
      }
    }
  }

  fn args(&mut self) -> Result<Vec<Expr>> {
    self.expect(&Token::LParen)?;
    let mut args = Vec::new();

    if self.eat(&Token::RParen) {
      return Ok(args);
    }

    loop {
      args.push(self.assignment()?);

      if !self.eat(&Token::Comma) {
        break;
      }
    }

    self.expect(&Token::RParen)?;
    Ok(args)
  }

  fn primary(&mut self) -> Result<Expr> {
    match self.peek().clone() {
      Token::IntLit(i) => {
        self.advance();
        Ok(Expr::LitInt(i))
      }

      Token::FloatLit(x) => {
        self.advance();
        Ok(Expr::LitFloat(x))
      }

      Token::DoubleLit(x) => {
        self.advance();
        Ok(Expr::LitDouble(x))
      }

      Token::BoolLit(b) => {
        self.advance();
        Ok(Expr::LitBool(b))
      }

      Token::Ident(name) => {
        self.advance();

        if *self.peek() == Token::LParen {
          let args = self.args()?;
          Ok(Expr::Call(name, args))
        } else {
          Ok(Expr::Var(name))
        }
      }

      Token::TypeName(_) => {
        let ty = self.ty()?;
        let args = self.args()?;
        Ok(Expr::Construct(ty, args))
      }

      Token::MakeClosure => {
        self.advance();
        self.expect(&Token::Lt)?;
        let name = self.expect_ident()?;
        self.expect(&Token::Gt)?;
        let args = self.args()?;
        self.closures.insert(name.clone());

        Ok(Expr::MakeClosure(name, args))
      }

      Token::LParen => {
        self.advance();
        let e = self.expr()?;
        self.expect(&Token::RParen)?;
        Ok(e)
      }

      t => Err(self.error(format!("expected an expression, found {:?}", t))),
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;

  fn lit_f(x: f32) -> Box<Expr> {
    Box::new(Expr::LitFloat(x))
  }

  fn var(name: &str) -> Box<Expr> {
    Box::new(Expr::Var(name.to_owned()))
  }

  #[test]
  fn shader_entry() {
    let p = parse("shader f(float x, out float y) { y = x * x; }").unwrap();
    let shader = p.shader.unwrap();

    assert_eq!(shader.name, "f");
    assert!(shader.is_shader);
    assert_eq!(
      shader.params,
      vec![
        Param {
          name: "x".to_owned(),
          ty: Type::Float,
          is_output: false
        },
        Param {
          name: "y".to_owned(),
          ty: Type::Float,
          is_output: true
        },
      ]
    );
    assert_eq!(
      shader.body.unwrap(),
      vec![Stmt::Expr(Expr::Assign {
        op: AssignOp::Set,
        target: var("y"),
        value: Box::new(Expr::Mul(var("x"), var("x"))),
      })]
    );
  }

  #[test]
  fn precedence() {
    let p = parse("shader f() { a = b = 1.0 + 2.0 * 3.0 < 4.0 || c; }").unwrap();
    let body = p.shader.unwrap().body.unwrap();

    let sum = Expr::Add(lit_f(1.), Box::new(Expr::Mul(lit_f(2.), lit_f(3.))));
    let rhs = Expr::Or(Box::new(Expr::Lt(Box::new(sum), lit_f(4.))), var("c"));

    assert_eq!(
      body,
      vec![Stmt::Expr(Expr::Assign {
        op: AssignOp::Set,
        target: var("a"),
        value: Box::new(Expr::Assign {
          op: AssignOp::Set,
          target: var("b"),
          value: Box::new(rhs),
        }),
      })]
    );
  }

  #[test]
  fn declarations_structs_and_closures() {
    let src = "
      struct Foo { float a, b; int c; };
      float custom_square(float x);
      float twice(float x) { return x * 2.0; }
      shader s(out closure c) {
        Foo foo;
        c = make_closure<Lambert>(111, foo.a) + make_closure<Microfacet>(1.0);
      }
    ";

    let p = parse(src).unwrap();

    assert_eq!(p.structures.len(), 1);
    assert_eq!(p.structures[0].fields.len(), 3);
    assert_eq!(p.functions.len(), 2);
    assert!(p.functions[0].body.is_none());
    assert!(p.functions[1].body.is_some());
    assert_eq!(
      p.closures.into_iter().collect::<Vec<_>>(),
      vec!["Lambert".to_owned(), "Microfacet".to_owned()]
    );
  }

  #[test]
  fn control_flow() {
    let src = "
      shader s(out int r) {
        for (int i = 0; i < 4; i++) { if (i == 2) continue; else r += i; }
        do { r--; } while (r > 10);
        while (true) break;
      }
    ";

    let body = parse(src).unwrap().shader.unwrap().body.unwrap();
    assert!(matches!(body[0], Stmt::For { .. }));
    assert!(matches!(body[1], Stmt::DoWhile { .. }));
    assert!(matches!(body[2], Stmt::While { .. }));
  }

  #[test]
  fn errors_carry_positions() {
    let err = parse("shader f() {\n  float x = ;\n}").unwrap_err();
    assert!(matches!(err, TslError::Syntax { line: 2, column: 13, .. }));

    assert!(matches!(
      parse("shader a() {} shader b() {}"),
      Err(TslError::Syntax { .. })
    ));
    assert!(matches!(parse("shader a() {"), Err(TslError::Syntax { .. })));
  }

  #[test]
  fn nesting_is_bounded() {
    let parens = |n: usize| {
      format!(
        "shader f(out float y) {{ y = {}1.0{}; }}",
        "(".repeat(n),
        ")".repeat(n)
      )
    };
    let negations = |n: usize| format!("shader f(out float y) {{ y = {}1.0; }}", "-".repeat(n));
    let sums = |n: usize| format!("shader f(out int y) {{ y = 1{}; }}", " + 1".repeat(n));
    let blocks = |n: usize| format!("shader f() {{ {}{} }}", "{".repeat(n), "}".repeat(n));
    let fields = |n: usize| format!("shader f(out float y) {{ y = v{}; }}", ".x".repeat(n));

    for source in [parens(30), negations(100), sums(100), blocks(100), fields(100)] {
      assert!(parse(&source).is_ok(), "{}", source);
    }

    for source in [
      parens(MAX_NESTING + 1),
      negations(MAX_NESTING + 1),
      sums(MAX_NESTING + 1),
      blocks(MAX_NESTING + 1),
      fields(MAX_NESTING + 1),
      parens(10_000),
      negations(10_000),
      sums(10_000),
      blocks(10_000),
    ] {
      assert!(matches!(parse(&source), Err(TslError::Syntax { .. })));
    }
  }

  #[test]
  fn empty_source() {
    assert_eq!(parse("  // nothing\n").unwrap(), ParsedProgram::default());
  }
}
