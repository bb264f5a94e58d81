//! Macros for building statement arguments.
//!
//! `&str`/`String` arguments become verbatim SQL fragments; every other type
//! is converted to a quoted [`Value`](crate::models::Value).

/// Build a `Vec<Arg>` for `Client::query`, `Client::execute` and friends.
///
/// # Example
///
/// ```ignore
/// client.execute(&sql_args!["UPDATE t SET n = ", 5, " WHERE id = ", id])?;
/// ```
#[macro_export]
macro_rules! sql_args {
    ($($arg:expr),* $(,)?) => {
        vec![$($crate::models::Arg::from($arg)),*]
    };
}

/// Build the `HashMap<String, Arg>` used by template substitution.
///
/// # Example
///
/// ```ignore
/// let values = sql_values! { "table" => "orders", "id" => Arg::quoted(7) };
/// client.query_with("SELECT * FROM {table} WHERE id = {id}", &values)?;
/// ```
#[macro_export]
macro_rules! sql_values {
    ($($key:expr => $arg:expr),* $(,)?) => {{
        let mut values = ::std::collections::HashMap::<String, $crate::models::Arg>::new();
        $(values.insert(::std::string::String::from($key), $crate::models::Arg::from($arg));)*
        values
    }};
}

pub use sql_args;
pub use sql_values;
