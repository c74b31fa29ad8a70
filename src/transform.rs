// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Transforms applied to each item by the worker threads.

use std::convert::Infallible;
use std::fmt::Display;

/// A function from one input item to zero or one output item, which may fail.
///
/// A transform is called concurrently from several worker threads, on
/// different items. It must bound its own execution time: a call that never
/// returns stalls its worker forever.
///
/// Closures returning `Result<Option<Output>, E>` implement this trait
/// directly:
///
/// ```
/// # use blockpipe::Transform;
/// let parse = |line: &str| match line.trim() {
///     "" => Ok(None),
///     value => value.parse::<u32>().map(Some),
/// };
/// assert_eq!(parse.transform("42"), Ok(Some(42)));
/// assert_eq!(parse.transform(" "), Ok(None));
/// assert!(parse.transform("abc").is_err());
/// ```
pub trait Transform<Input, Output>: Sync {
    /// Error describing why a single item failed.
    type Error: Display;

    /// Transforms one item.
    ///
    /// - `Ok(Some(output))` emits the output,
    /// - `Ok(None)` drops the item,
    /// - `Err(e)` drops the item and logs the error as a warning; the pipeline
    ///   continues with the next item.
    ///
    /// A panic is handled like an error. The warnings are only emitted with
    /// the `log` feature enabled; otherwise failing items are dropped
    /// silently.
    fn transform(&self, input: Input) -> Result<Option<Output>, Self::Error>;
}

impl<Input, Output, E, F> Transform<Input, Output> for F
where
    F: Fn(Input) -> Result<Option<Output>, E> + Sync,
    E: Display,
{
    type Error = E;

    fn transform(&self, input: Input) -> Result<Option<Output>, E> {
        self(input)
    }
}

/// Transform that maps every item to exactly one output.
///
/// ```
/// # use blockpipe::{map, Transform};
/// assert_eq!(map(|x: u32| x + 1).transform(1), Ok(Some(2)));
/// ```
#[derive(Clone, Copy, Debug)]
pub struct Map<F> {
    f: F,
}

/// Creates a [`Map`] transform, which never drops nor fails.
pub fn map<F>(f: F) -> Map<F> {
    Map { f }
}

impl<Input, Output, F> Transform<Input, Output> for Map<F>
where
    F: Fn(Input) -> Output + Sync,
{
    type Error = Infallible;

    fn transform(&self, input: Input) -> Result<Option<Output>, Infallible> {
        Ok(Some((self.f)(input)))
    }
}

/// Transform that maps every item to zero or one output.
///
/// ```
/// # use blockpipe::{filter_map, Transform};
/// let even_halves = filter_map(|x: u32| (x % 2 == 0).then_some(x / 2));
/// assert_eq!(even_halves.transform(4), Ok(Some(2)));
/// assert_eq!(even_halves.transform(3), Ok(None));
/// ```
#[derive(Clone, Copy, Debug)]
pub struct FilterMap<F> {
    f: F,
}

/// Creates a [`FilterMap`] transform, which drops the items for which `f`
/// returns [`None`] and never fails.
pub fn filter_map<F>(f: F) -> FilterMap<F> {
    FilterMap { f }
}

impl<Input, Output, F> Transform<Input, Output> for FilterMap<F>
where
    F: Fn(Input) -> Option<Output> + Sync,
{
    type Error = Infallible;

    fn transform(&self, input: Input) -> Result<Option<Output>, Infallible> {
        Ok((self.f)(input))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// A transform with a named error type.
    struct Halve;

    impl Transform<u32, u32> for Halve {
        type Error = String;

        fn transform(&self, input: u32) -> Result<Option<u32>, String> {
            if input % 2 == 0 {
                Ok(Some(input / 2))
            } else {
                Err(format!("{input} is odd"))
            }
        }
    }

    #[test]
    fn test_custom_transform() {
        assert_eq!(Halve.transform(8), Ok(Some(4)));
        assert_eq!(Halve.transform(7), Err("7 is odd".to_owned()));
    }

    #[test]
    fn test_closure_transform() {
        let drop_zero = |x: i64| {
            if x == 0 {
                Ok(None)
            } else if x < 0 {
                Err("negative")
            } else {
                Ok(Some(x * 10))
            }
        };
        assert_eq!(drop_zero.transform(3), Ok(Some(30)));
        assert_eq!(drop_zero.transform(0), Ok(None));
        assert_eq!(drop_zero.transform(-1), Err("negative"));
    }

    #[test]
    fn test_map_and_filter_map() {
        assert_eq!(map(|s: &str| s.len()).transform("four"), Ok(Some(4)));
        let non_empty = filter_map(|s: &str| (!s.is_empty()).then(|| s.to_uppercase()));
        assert_eq!(non_empty.transform("ab"), Ok(Some("AB".to_owned())));
        assert_eq!(non_empty.transform(""), Ok(None));
    }
}
