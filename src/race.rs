//! Choice combinators.
//!
//! Each combinator first awaits a discriminator future, then schedules at
//! most one of its candidate branches. A failed discriminator short-circuits
//! the whole choice without scheduling any branch.

use crate::error::Error;
use crate::future::Future;
use std::collections::HashMap;
use std::hash::Hash;

impl<T: Clone + Send + 'static> Future<T> {
    /// Continues with `if_true` or `if_false` depending on `cond`.
    pub fn alternative(cond: Future<bool>, if_true: Future<T>, if_false: Future<T>) -> Future<T> {
        cond.continue_with(move |outcome| {
            match outcome {
                Ok(true) => if_true,
                Ok(false) => if_false,
                Err(err) => Future::from_outcome(Err(err)),
            }
        })
    }

    /// Continues with the branch at the index produced by `index`.
    ///
    /// An index past the end fails with `Error::NotFound`.
    pub fn choice_array(index: Future<usize>, branches: Vec<Future<T>>) -> Future<T> {
        index.continue_with(move |outcome| {
            let selected = outcome.and_then(|i| {
                let len = branches.len();

                branches.into_iter()
                    .nth(i)
                    .ok_or_else(|| Error::not_found(format!("no branch at index {}; len={}", i, len)))
            });

            selected.unwrap_or_else(|err| Future::from_outcome(Err(err)))
        })
    }

    /// Continues with the branch registered under the key produced by `key`.
    ///
    /// An absent key fails with `Error::NotFound`.
    pub fn choice_map<K>(key: Future<K>, mut branches: HashMap<K, Future<T>>) -> Future<T>
        where K: Eq + Hash + Clone + Send + 'static
    {
        key.continue_with(move |outcome| {
            let selected = outcome.and_then(|k| {
                branches.remove(&k)
                    .ok_or_else(|| Error::not_found("no branch for key"))
            });

            selected.unwrap_or_else(|err| Future::from_outcome(Err(err)))
        })
    }

    /// Continues with the branch `selector` picks for the discriminator
    /// value.
    ///
    /// `selector` is a partial function: returning `None` means it is not
    /// defined for the value, which fails with `Error::NotFound`.
    pub fn choice<A, F>(discriminator: Future<A>, selector: F) -> Future<T>
        where A: Clone + Send + 'static,
              F: FnOnce(A) -> Option<Future<T>> + Send + 'static
    {
        discriminator.continue_with(move |outcome| {
            let selected = outcome.and_then(|val| {
                selector(val).ok_or_else(|| Error::not_found("selector not defined for value"))
            });

            selected.unwrap_or_else(|err| Future::from_outcome(Err(err)))
        })
    }
}
