//! The list of exports a server advertises through `NBD_OPT_LIST` and
//! resolves during `NBD_OPT_EXPORT_NAME`/`NBD_OPT_GO`.
//!
//! Grounded on `server/exports.c`: a flat, insertion-ordered list with a
//! cap on both the number of exports and the length of each name and
//! description. Two distinct "default" conventions live here: an empty
//! client-supplied name resolves to the first export added, and
//! `use_default` separately asks for the backend's own default export
//! name to be appended when the list is sent.

use color_eyre::eyre::{bail, Result};

use crate::proto::NBD_MAX_STRING;

/// nbdkit's hard cap on the number of exports a single server may list.
pub const MAX_EXPORTS: usize = 10_000;

#[derive(Debug, Clone)]
pub struct Export {
    pub name: String,
    pub description: Option<String>,
}

/// An ordered, capped collection of exports.
#[derive(Debug, Clone, Default)]
pub struct ExportList {
    exports: Vec<Export>,
    use_default: bool,
}

impl ExportList {
    pub fn new() -> Self {
        Self {
            exports: vec![],
            use_default: false,
        }
    }

    /// Ask for the backend's own default export name to be appended when
    /// the list is next sent to a client, matching
    /// `nbdkit_use_default_export`. Lets a backend that doesn't know its
    /// export name ahead of time (it's only resolved once the backend is
    /// asked) still appear in `NBD_OPT_LIST`.
    pub fn use_default(&mut self) {
        self.use_default = true;
    }

    pub fn is_using_default(&self) -> bool {
        self.use_default
    }

    /// Exports to send in an `NBD_OPT_LIST` reply: the statically added
    /// ones, plus (if `use_default` was requested) the name the backend
    /// reports as its default, resolved at reply time rather than when
    /// the list was built. Mirrors `exports_resolve_default`, except the
    /// resolved name isn't folded back into the stored list, since the
    /// default is free to change between two `NBD_OPT_LIST` calls on the
    /// same connection.
    pub fn iter_with_default<'a>(
        &'a self,
        default_name: Option<&'a str>,
    ) -> impl Iterator<Item = &'a str> {
        let default = if self.use_default { default_name } else { None };
        self.exports.iter().map(|e| e.name.as_str()).chain(default)
    }

    pub fn add(&mut self, name: impl Into<String>, description: Option<String>) -> Result<()> {
        if self.exports.len() >= MAX_EXPORTS {
            bail!("too many exports (limit is {MAX_EXPORTS})");
        }
        let name = name.into();
        if name.len() as u32 > NBD_MAX_STRING {
            bail!("export name exceeds {NBD_MAX_STRING} bytes");
        }
        if let Some(d) = &description {
            if d.len() as u32 > NBD_MAX_STRING {
                bail!("export description exceeds {NBD_MAX_STRING} bytes");
            }
        }
        self.exports.push(Export { name, description });
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Export> {
        self.exports.iter()
    }

    pub fn len(&self) -> usize {
        self.exports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exports.is_empty()
    }

    /// Resolve a client-supplied export name to one of our exports. The
    /// empty string means "use the default export" (the first one added),
    /// matching `exports_resolve_default`/`nbdkit_use_default_export`.
    pub fn resolve(&self, name: &str) -> Option<&Export> {
        if name.is_empty() {
            return self.exports.first();
        }
        self.exports.iter().find(|e| e.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_name_resolves_to_first_export() {
        let mut list = ExportList::new();
        list.add("default", None).unwrap();
        list.add("other", None).unwrap();
        assert_eq!(list.resolve("").unwrap().name, "default");
    }

    #[test]
    fn unknown_name_resolves_to_none() {
        let mut list = ExportList::new();
        list.add("default", None).unwrap();
        assert!(list.resolve("missing").is_none());
    }

    #[test]
    fn rejects_oversized_name() {
        let mut list = ExportList::new();
        let name = "a".repeat(NBD_MAX_STRING as usize + 1);
        assert!(list.add(name, None).is_err());
    }

    #[test]
    fn default_name_only_appended_when_requested() {
        let mut list = ExportList::new();
        list.add("explicit", None).unwrap();
        assert_eq!(
            list.iter_with_default(Some("backend-default")).collect::<Vec<_>>(),
            vec!["explicit"]
        );
        list.use_default();
        assert!(list.is_using_default());
        assert_eq!(
            list.iter_with_default(Some("backend-default")).collect::<Vec<_>>(),
            vec!["explicit", "backend-default"]
        );
        assert_eq!(
            list.iter_with_default(None).collect::<Vec<_>>(),
            vec!["explicit"]
        );
    }
}
