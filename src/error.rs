use std::any::Any;

/// Trait for errors that may be returned from the controller entry points. This just sets up the
/// trait bounds that are required, since we typically only expose rather opaque boxed
/// error types, and they will need to be sent between tasks.
pub trait ControllerError: std::error::Error + Send + 'static + Any {
    fn as_any(&self) -> &dyn Any;
}
impl<T> ControllerError for T
where
    T: std::error::Error + Send + 'static + Any,
{
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub type Error = Box<dyn ControllerError>;

impl dyn ControllerError {
    /// convenience function for downcasting the error to a concrete type
    pub fn as_type<T: ControllerError>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Returns true if the error is of the given concrete type, in which case
    /// `as_type::<T>()` will return `Some`.
    pub fn is_type<T: ControllerError>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

impl<T> From<T> for Error
where
    T: ControllerError,
{
    fn from(e: T) -> Error {
        Box::new(e)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct Boom;
    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("boom")
        }
    }
    impl std::error::Error for Boom {}

    #[test]
    fn boxed_error_can_be_downcast() {
        let err: Error = Boom.into();
        assert!(err.is_type::<Boom>());
        assert!(err.as_type::<std::io::Error>().is_none());
        assert_eq!("boom", err.to_string());
    }
}
