//! Parsing of RFC 8288 `Link` response headers.
//!
//! Only the pieces pagination needs are understood: `<uri>` targets and their
//! `rel` parameters. Other parameters are ignored.

/// One `<uri>; rel="..."` pair of a `Link` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRelation {
	pub url: String,
	pub rel: String,
}

/// Parse every relation out of a `Link` header value.
///
/// A link carrying a space-separated `rel` list yields one entry per relation
/// type. Relation types are lowercased. Segments without a closing `>` end
/// parsing.
pub fn parse_link_header(value: &str) -> Vec<LinkRelation> {
	let mut links = Vec::new();
	let mut rest = value;

	while let Some(open) = rest.find('<') {
		let after_open = &rest[open + 1..];
		let Some(close) = after_open.find('>') else {
			break;
		};

		let url = after_open[..close].trim();
		let tail = &after_open[close + 1..];
		let params_end = tail.find('<').unwrap_or(tail.len());

		for rel in rel_types(&tail[..params_end]) {
			links.push(LinkRelation {
				url: url.to_string(),
				rel,
			});
		}

		rest = &tail[params_end..];
	}

	links
}

/// URL of the `rel="next"` relation, if the header has one.
pub fn next_link(value: &str) -> Option<String> {
	parse_link_header(value)
		.into_iter()
		.find(|link| link.rel == "next")
		.map(|link| link.url)
}

fn rel_types(params: &str) -> Vec<String> {
	params
		.split(';')
		.filter_map(|param| param.split_once('='))
		.filter(|(name, _)| name.trim().eq_ignore_ascii_case("rel"))
		.flat_map(|(_, value)| {
			value
				.trim()
				.trim_end_matches(',')
				.trim()
				.trim_matches('"')
				.split_whitespace()
				.map(str::to_ascii_lowercase)
				.collect::<Vec<_>>()
		})
		.collect()
}
