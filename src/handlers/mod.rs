//! HTTP handlers (ambient/external-interface, §6): one module per REST
//! surface, mirroring the source project's `handlers/` split.
//!
//! A resource path is `"/" segment` repeated (`segment` excludes `/`,
//! `:`, `;`, `?`); a version is addressed as `<path>:<tag>`; sub-resources
//! hang off the final segment behind a `;` (`;acl[/<access>[/<role>]]`,
//! `;metadata[/<field>]`, `;versions`, `;upload[/<job>[/<position>]]`).
//! Because the `;` lives inside a single path segment rather than as a
//! `/`-delimited one, axum's per-segment extractors can't split it out --
//! [`parse_resource`] does this by hand against the raw wildcard tail.

pub mod acl;
pub mod metadata;
pub mod name;
pub mod upload;

use crate::errors::ErrorKind;

/// A request path decomposed into the resource it names and any
/// sub-resource it addresses (§6 "Path grammar").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedResource {
    /// A namespace or object path, no version tag, no sub-resource.
    Name { path: String },
    /// `<path>:<tag>`, no sub-resource.
    Version { path: String, tag: String },
    /// `<path>[:<tag>];acl[/<access>[/<role>]]`.
    Acl {
        path: String,
        tag: Option<String>,
        access: Option<String>,
        role: Option<String>,
    },
    /// `<path>[:<tag>];metadata[/<field>]`.
    Metadata {
        path: String,
        tag: Option<String>,
        field: Option<String>,
    },
    /// `<path>;versions`.
    Versions { path: String },
    /// `<path>;upload[/<job>[/<position>]]`.
    Upload {
        path: String,
        job: Option<String>,
        position: Option<u64>,
    },
}

/// Parse the raw tail of a request URI (everything after the service's
/// `/p` prefix, still percent-undecoded-agnostic since none of the
/// grammar's delimiters are ever percent-encoded by a conforming client)
/// into a [`ParsedResource`].
///
/// `tail` must not include the leading `/p`; it is given exactly as axum
/// hands back a `/p/*rest` wildcard match, i.e. with or without a leading
/// `/`. The empty tail denotes the root namespace `/`.
pub fn parse_resource(tail: &str) -> Result<ParsedResource, ErrorKind> {
    let s = if tail.is_empty() {
        "/".to_string()
    } else if tail.starts_with('/') {
        tail.to_string()
    } else {
        format!("/{tail}")
    };

    let (before, after) = match s.split_once(';') {
        Some((b, a)) => (b, Some(a)),
        None => (s.as_str(), None),
    };

    let (path, tag) = match before.split_once(':') {
        Some((p, t)) => (reject_dotdot(p)?.to_string(), Some(t.to_string())),
        None => (reject_dotdot(before)?.to_string(), None),
    };

    let path = if path.is_empty() { "/".to_string() } else { path };

    match after {
        None => match tag {
            Some(tag) => Ok(ParsedResource::Version { path, tag }),
            None => Ok(ParsedResource::Name { path }),
        },
        Some(rest) if rest == "versions" => {
            if tag.is_some() {
                return Err(ErrorKind::BadRequest(
                    "';versions' cannot be combined with a version tag".into(),
                ));
            }
            Ok(ParsedResource::Versions { path })
        }
        Some(rest) if rest == "acl" || rest.starts_with("acl/") => {
            let trailer = rest.strip_prefix("acl").and_then(|t| t.strip_prefix('/'));
            let (access, role) = match trailer {
                None | Some("") => (None, None),
                Some(t) => match t.split_once('/') {
                    Some((a, r)) => (Some(a.to_string()), Some(r.to_string())),
                    None => (Some(t.to_string()), None),
                },
            };
            Ok(ParsedResource::Acl { path, tag, access, role })
        }
        Some(rest) if rest == "metadata" || rest.starts_with("metadata/") => {
            let trailer = rest.strip_prefix("metadata").and_then(|t| t.strip_prefix('/'));
            let field = match trailer {
                None | Some("") => None,
                Some(t) => Some(t.to_string()),
            };
            Ok(ParsedResource::Metadata { path, tag, field })
        }
        Some(rest) if rest == "upload" || rest.starts_with("upload/") => {
            if tag.is_some() {
                return Err(ErrorKind::BadRequest(
                    "';upload' cannot be combined with a version tag".into(),
                ));
            }
            let trailer = rest.strip_prefix("upload").and_then(|t| t.strip_prefix('/'));
            let (job, position) = match trailer {
                None | Some("") => (None, None),
                Some(t) => match t.split_once('/') {
                    Some((j, p)) => {
                        let position: u64 = p
                            .parse()
                            .map_err(|_| ErrorKind::BadRequest(format!("invalid chunk position '{p}'")))?;
                        (Some(j.to_string()), Some(position))
                    }
                    None => (Some(t.to_string()), None),
                },
            };
            Ok(ParsedResource::Upload { path, job, position })
        }
        Some(other) => Err(ErrorKind::BadRequest(format!("unrecognized sub-resource ';{other}'"))),
    }
}

fn reject_dotdot(path: &str) -> Result<&str, ErrorKind> {
    for segment in path.split('/') {
        if segment == "." || segment == ".." {
            return Err(ErrorKind::BadRequest(format!(
                "path segment '{segment}' is not allowed"
            )));
        }
    }
    Ok(path)
}

/// Render an `ErrorKind::NotFound` when a resource required to exist was
/// not returned by `resolve`.
pub(crate) fn not_found(path: &str) -> ErrorKind {
    ErrorKind::NotFound(format!("'{path}' does not exist"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_name() {
        assert_eq!(
            parse_resource("a/b/obj").unwrap(),
            ParsedResource::Name { path: "/a/b/obj".into() }
        );
    }

    #[test]
    fn parses_root() {
        assert_eq!(parse_resource("").unwrap(), ParsedResource::Name { path: "/".into() });
    }

    #[test]
    fn parses_version() {
        assert_eq!(
            parse_resource("a/obj:V1").unwrap(),
            ParsedResource::Version { path: "/a/obj".into(), tag: "V1".into() }
        );
    }

    #[test]
    fn parses_versions_listing() {
        assert_eq!(
            parse_resource("a/obj;versions").unwrap(),
            ParsedResource::Versions { path: "/a/obj".into() }
        );
    }

    #[test]
    fn parses_acl_whole_and_access_and_role() {
        assert_eq!(
            parse_resource("a/obj;acl").unwrap(),
            ParsedResource::Acl { path: "/a/obj".into(), tag: None, access: None, role: None }
        );
        assert_eq!(
            parse_resource("a/obj;acl/read").unwrap(),
            ParsedResource::Acl {
                path: "/a/obj".into(),
                tag: None,
                access: Some("read".into()),
                role: None
            }
        );
        assert_eq!(
            parse_resource("a/obj;acl/read/alice").unwrap(),
            ParsedResource::Acl {
                path: "/a/obj".into(),
                tag: None,
                access: Some("read".into()),
                role: Some("alice".into())
            }
        );
    }

    #[test]
    fn parses_acl_on_a_version() {
        assert_eq!(
            parse_resource("a/obj:V1;acl/owner").unwrap(),
            ParsedResource::Acl {
                path: "/a/obj".into(),
                tag: Some("V1".into()),
                access: Some("owner".into()),
                role: None
            }
        );
    }

    #[test]
    fn parses_metadata_whole_and_field() {
        assert_eq!(
            parse_resource("a/obj;metadata").unwrap(),
            ParsedResource::Metadata { path: "/a/obj".into(), tag: None, field: None }
        );
        assert_eq!(
            parse_resource("a/obj;metadata/content-type").unwrap(),
            ParsedResource::Metadata {
                path: "/a/obj".into(),
                tag: None,
                field: Some("content-type".into())
            }
        );
    }

    #[test]
    fn parses_upload_job_and_position() {
        assert_eq!(
            parse_resource("a/obj;upload").unwrap(),
            ParsedResource::Upload { path: "/a/obj".into(), job: None, position: None }
        );
        assert_eq!(
            parse_resource("a/obj;upload/job1").unwrap(),
            ParsedResource::Upload { path: "/a/obj".into(), job: Some("job1".into()), position: None }
        );
        assert_eq!(
            parse_resource("a/obj;upload/job1/4").unwrap(),
            ParsedResource::Upload {
                path: "/a/obj".into(),
                job: Some("job1".into()),
                position: Some(4)
            }
        );
    }

    #[test]
    fn rejects_dotdot_segments() {
        assert!(matches!(parse_resource("a/../obj"), Err(ErrorKind::BadRequest(_))));
        assert!(matches!(parse_resource("./obj"), Err(ErrorKind::BadRequest(_))));
    }

    #[test]
    fn rejects_unrecognized_subresource() {
        assert!(matches!(parse_resource("a/obj;bogus"), Err(ErrorKind::BadRequest(_))));
    }

    #[test]
    fn rejects_upload_with_version_tag() {
        assert!(matches!(
            parse_resource("a/obj:V1;upload"),
            Err(ErrorKind::BadRequest(_))
        ));
    }
}
