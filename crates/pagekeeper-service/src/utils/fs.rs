use std::io;

/// Runs `f`, mapping a `NotFound` error to `Ok(None)`.
///
/// Files in the cache directories may vanish at any time because of a concurrent purge, which
/// callers treat the same as a file that never existed.
pub fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
