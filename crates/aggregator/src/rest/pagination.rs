// `Link` header pagination.
//
// Pages advertise the next page as `<url>; rel="next"`. Targets are usually
// relative (`./presence?...`) and resolve against the URL of the page that
// carried the header.

use url::Url;

/// Resolve the `rel="next"` target of a `Link` header, if any.
pub fn next_link(header: &str, page_url: &Url) -> Option<Url> {
    link_targets(header)
        .find(|(_, params)| has_rel(params, "next"))
        .and_then(|(target, _)| page_url.join(target).ok())
}

/// Iterate `(target, params)` pairs. Targets may themselves contain commas,
/// so entries are split on `<` rather than on `,`.
fn link_targets(header: &str) -> impl Iterator<Item = (&str, &str)> {
    header.split('<').skip(1).filter_map(|entry| {
        let (target, params) = entry.split_once('>')?;
        Some((target.trim(), params))
    })
}

fn has_rel(params: &str, wanted: &str) -> bool {
    params
        .split(';')
        .filter_map(|param| param.trim().split_once('='))
        .filter(|(name, _)| name.trim().eq_ignore_ascii_case("rel"))
        .any(|(_, value)| {
            value
                .trim()
                .trim_end_matches(',')
                .trim()
                .trim_matches('"')
                .split_whitespace()
                .any(|rel| rel.eq_ignore_ascii_case(wanted))
        })
}
