//! [`OnError`] trait definition and implementation.

/// Observe an error on its way through, typically to log it at the edge
/// where it is mapped, without breaking the `?` chain.
pub trait OnError<E>
where
    E: std::fmt::Display,
{
    #[must_use]
    /// Call `f` with the error, if there is one.
    fn on_err<F>(self, f: F) -> Self
    where
        F: FnOnce(&E);
}

impl<T, E> OnError<E> for Result<T, E>
where
    E: std::fmt::Display,
{
    /// Call `f` when the [`Result`] is [`Err`].
    fn on_err<F>(self, f: F) -> Self
    where
        F: FnOnce(&E),
    {
        if let Err(err) = &self {
            f(err);
        }
        self
    }
}
