use once_cell::sync::OnceCell;

use crate::{Builder, Error, Pool};

static COMMON: OnceCell<Pool> = OnceCell::new();

/// Get a shared reference to a common pool for the entire process.
///
/// # Examples
///
/// ```
/// let (tx, rx) = std::sync::mpsc::channel();
///
/// slotpool::common().submit(move || tx.send(2 + 2).unwrap()).unwrap();
///
/// assert_eq!(rx.recv().unwrap(), 4);
/// ```
pub fn common() -> &'static Pool {
    COMMON.get_or_init(|| {
        // The default configuration is always valid: capacity is at least
        // one core and the default idle timeout is non-zero.
        common_builder().build().unwrap()
    })
}

/// Configure the common pool.
///
/// This should be done near the start of your program before any other code
/// uses the common pool, as this function will return an error if the common
/// pool has already been initialized.
///
/// Only programs should use this function! Libraries should not use this
/// function and instead allow the running program to configure the common
/// pool. If you need a customized pool in a library then you should use a
/// separate pool instance.
///
/// # Errors
///
/// Returns [`Error::AlreadyInitialized`] if the common pool is already in
/// use, or a configuration error if the supplied builder settings are
/// invalid.
pub fn configure_common<F>(f: F) -> Result<(), Error>
where
    F: FnOnce(Builder) -> Builder,
{
    let pool = f(common_builder()).build()?;

    COMMON.set(pool).map_err(|_| Error::AlreadyInitialized)
}

fn common_builder() -> Builder {
    Builder::default().name("common-pool")
}
