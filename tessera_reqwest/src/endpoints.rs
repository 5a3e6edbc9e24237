use std::fmt;

use predicates::{reflection, Predicate};
use reqwest::Request;

/// Path suffixes of the API endpoints that never carry credentials
pub const DEFAULT_PUBLIC_PATHS: [&str; 6] = [
    "/auth/login",
    "/auth/register",
    "/auth/refresh",
    "/auth/forgot-password",
    "/auth/reset-password",
    "/auth/verify",
];

/// Matches requests to endpoints that must be sent without credentials
///
/// A request matches if its URL path ends with one of the configured
/// suffixes. By default, these are the [`DEFAULT_PUBLIC_PATHS`].
#[derive(Clone, Debug)]
pub struct PublicEndpoints {
    suffixes: Vec<String>,
}

impl Default for PublicEndpoints {
    fn default() -> Self {
        Self::new(DEFAULT_PUBLIC_PATHS)
    }
}

impl PublicEndpoints {
    /// Matches requests whose path ends with any of `suffixes`
    pub fn new<I, S>(suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            suffixes: suffixes
                .into_iter()
                .map(Into::<String>::into)
                .map(|s| s.trim_end_matches('/').to_owned())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    /// Adds another public path suffix
    pub fn with_path(mut self, suffix: impl Into<String>) -> Self {
        let suffix = suffix.into();
        let suffix = suffix.trim_end_matches('/');
        if !suffix.is_empty() {
            self.suffixes.push(suffix.to_owned());
        }
        self
    }

    fn matching_suffix(&self, req: &Request) -> Option<&str> {
        let path = req.url().path().trim_end_matches('/');
        self.suffixes
            .iter()
            .map(String::as_str)
            .find(|suffix| path.ends_with(suffix))
    }
}

impl Predicate<Request> for PublicEndpoints {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        self.matching_suffix(req).is_some()
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "path",
                    req.url().path().to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for PublicEndpoints {}
impl fmt::Display for PublicEndpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("path ends with one of [")?;
        for (i, suffix) in self.suffixes.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(suffix)?;
        }
        f.write_str("]")
    }
}

/// Matches requests bound for any host other than the API's own
///
/// Combined with [`PublicEndpoints`], this keeps the access token from
/// being sent to third parties through a shared client.
#[derive(Clone, Debug)]
pub struct ForeignHost {
    host: String,
}

impl ForeignHost {
    /// Treats every host other than `host` as foreign
    pub fn new<S>(host: S) -> Self
    where
        S: ToString,
    {
        Self {
            host: host.to_string(),
        }
    }

    /// Treats every host other than the one in `url` as foreign
    ///
    /// Returns `None` if the URL has no host.
    pub fn of(url: &reqwest::Url) -> Option<Self> {
        url.host_str().map(Self::new)
    }
}

impl Predicate<Request> for ForeignHost {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().host_str() != Some(&self.host)
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "host",
                    req.url()
                        .host_str()
                        .unwrap_or("<no host>")
                        .to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for ForeignHost {}
impl fmt::Display for ForeignHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("host != ")?;
        f.write_str(&self.host)
    }
}
