//! Helper for enums persisted as short text columns.

/// Returned when a stored or user-supplied string names no known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} {value:?}")]
pub struct ParseEnumError {
  pub kind: &'static str,
  pub value: String,
}

/// Declares a fieldless enum that round-trips through a fixed string, both in
/// serde and in SQLite columns. Parsing is case-insensitive.
macro_rules! text_enum {
  (
    $(#[$meta:meta])*
    pub enum $name:ident as $kind:literal {
      $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)?
    }
  ) => {
    $(#[$meta])*
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
    pub enum $name {
      $($(#[$vmeta])* #[serde(rename = $text)] $variant),+
    }

    impl $name {
      pub fn as_str(self) -> &'static str {
        match self {
          $($name::$variant => $text),+
        }
      }
    }

    impl std::fmt::Display for $name {
      fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
      }
    }

    impl std::str::FromStr for $name {
      type Err = $crate::text_enum::ParseEnumError;

      fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        $(if s.eq_ignore_ascii_case($text) {
          return Ok($name::$variant);
        })+
        Err($crate::text_enum::ParseEnumError {
          kind: $kind,
          value: s.to_string(),
        })
      }
    }

    impl rusqlite::types::ToSql for $name {
      fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        Ok(rusqlite::types::ToSqlOutput::from(self.as_str()))
      }
    }

    impl rusqlite::types::FromSql for $name {
      fn column_result(value: rusqlite::types::ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
        value
          .as_str()?
          .parse()
          .map_err(|e| rusqlite::types::FromSqlError::Other(Box::new(e)))
      }
    }
  };
}
