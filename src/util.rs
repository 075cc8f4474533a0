use std::sync::Mutex;

use http::{HeaderMap, Method, Uri};

use crate::error::Error;

const MAX_ERROR_BODY_LEN: usize = 2048;

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Later maps win on conflicting names.
pub(crate) fn merge_headers<'a>(layers: impl IntoIterator<Item = &'a HeaderMap>) -> HeaderMap {
    let mut merged = HeaderMap::new();
    for layer in layers {
        for name in layer.keys() {
            merged.remove(name);
            for value in layer.get_all(name) {
                merged.append(name.clone(), value.clone());
            }
        }
    }
    merged
}

pub(crate) fn join_base_path(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let relative = path.trim_start_matches('/');
    match (base.is_empty(), relative.is_empty()) {
        (true, true) => String::new(),
        (true, false) => relative.to_owned(),
        (false, true) => base.to_owned(),
        (false, false) => format!("{base}/{relative}"),
    }
}

/// Absolute `http(s)` paths are used as-is; anything else is joined onto the
/// base address.
pub(crate) fn resolve_uri(
    base_url: &str,
    path: &str,
    method: &Method,
) -> Result<(String, Uri), Error> {
    let uri_text = match path.parse::<Uri>() {
        Ok(uri) if uri.host().is_some() => {
            let supported = uri.scheme_str().is_some_and(|scheme| {
                scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https")
            });
            if !supported {
                return Err(Error::invalid_request(
                    format!("unsupported request uri: {path}"),
                    method,
                    path,
                ));
            }
            path.to_owned()
        }
        _ => join_base_path(base_url, path),
    };
    let uri = uri_text.parse::<Uri>().map_err(|source| {
        Error::invalid_request(
            format!("invalid request uri {uri_text}: {source}"),
            method,
            &uri_text,
        )
    })?;
    if uri.scheme().is_none() || uri.host().is_none() {
        return Err(Error::invalid_request(
            format!("request uri is not absolute: {uri_text}"),
            method,
            &uri_text,
        ));
    }
    Ok((uri_text, uri))
}

pub(crate) fn is_valid_base_url(base_url: &str) -> bool {
    if base_url.trim().len() != base_url.len() || base_url.is_empty() {
        return false;
    }
    let Ok(parsed) = url::Url::parse(base_url) else {
        return false;
    };
    matches!(parsed.scheme(), "http" | "https")
        && parsed.host_str().is_some()
        && parsed.username().is_empty()
        && parsed.password().is_none()
        && parsed.query().is_none()
        && parsed.fragment().is_none()
}

pub(crate) fn redact_uri_for_logs(uri_text: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(uri_text) else {
        return uri_text.split('?').next().unwrap_or(uri_text).to_owned();
    };
    let _ = parsed.set_username("");
    let _ = parsed.set_password(None);
    parsed.set_query(None);
    parsed.set_fragment(None);
    parsed.to_string()
}

pub(crate) fn append_query_pairs(path: &str, query_pairs: &[(String, String)]) -> String {
    if query_pairs.is_empty() {
        return path.to_owned();
    }

    let (without_fragment, fragment) = match path.split_once('#') {
        Some((left, right)) => (left, Some(right)),
        None => (path, None),
    };
    let (base, existing_query) = match without_fragment.split_once('?') {
        Some((left, right)) => (left, Some(right)),
        None => (without_fragment, None),
    };

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    if let Some(existing_query) = existing_query {
        for (name, value) in url::form_urlencoded::parse(existing_query.as_bytes()) {
            serializer.append_pair(&name, &value);
        }
    }
    for (name, value) in query_pairs {
        serializer.append_pair(name, value);
    }

    let mut merged = format!("{base}?{}", serializer.finish());
    if let Some(fragment) = fragment {
        merged.push('#');
        merged.push_str(fragment);
    }
    merged
}

pub(crate) fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.chars().count() <= MAX_ERROR_BODY_LEN {
        return text.into_owned();
    }

    let truncated: String = text.chars().take(MAX_ERROR_BODY_LEN).collect();
    format!("{truncated}...(truncated)")
}
