//! Error plumbing shared across crate boundaries.

use std::fmt;

pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;
pub type BoxedErrorResult<T> = std::result::Result<T, BoxedError>;

/// One-line rendering of an error and its source chain, for log fields.
pub struct CompactDisplay<'e>(pub &'e (dyn std::error::Error + 'e));

impl fmt::Display for CompactDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(err) = source {
            write!(f, ": {err}")?;
            source = err.source();
        }
        Ok(())
    }
}

pub trait FmtCompact {
    fn fmt_compact(&self) -> CompactDisplay<'_>;
}

impl<E> FmtCompact for E
where
    E: std::error::Error,
{
    fn fmt_compact(&self) -> CompactDisplay<'_> {
        CompactDisplay(self)
    }
}

/// [`BoxedError`] contents reach here through `as_ref`.
impl FmtCompact for dyn std::error::Error + Send + Sync {
    fn fmt_compact(&self) -> CompactDisplay<'_> {
        CompactDisplay(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Outer(Inner);

    #[derive(Debug)]
    struct Inner;

    impl fmt::Display for Outer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("outer failed")
        }
    }

    impl fmt::Display for Inner {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("inner cause")
        }
    }

    impl std::error::Error for Inner {}

    impl std::error::Error for Outer {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn compact_display_includes_chain() {
        let err = Outer(Inner);
        assert_eq!(err.fmt_compact().to_string(), "outer failed: inner cause");
    }
}
