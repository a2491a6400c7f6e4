//! Call routing engine
//!
//! The route table is an ordered list of `(partyA pattern, partyB
//! pattern) -> destination template` entries. A lookup concatenates the
//! parties as `a TAB b` and takes the first entry whose compiled
//! `^(A)\t(B)$` regex matches, resuming from a caller-held index so
//! failed destinations can fall through to later entries. Destination
//! templates carry macros substituted from the B party; a destination of
//! `label:<name>` restarts the search with the label as the new B party.

use regex::RegexBuilder;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

/// Upper bound on `label:` restarts; beyond this the lookup fails closed
/// instead of looping through mutually referencing labels
const MAX_LABEL_RESTARTS: usize = 16;

/// Characters that count as dialled digits for `<dn>` extraction
const DIGIT_CHARS: &str = "0123456789*#-.()";

/// One route table entry
#[derive(Debug, Clone)]
pub struct RouteEntry {
    party_a: String,
    party_b: String,
    destination: String,
    regex: regex::Regex,
}

impl RouteEntry {
    /// Build an entry from the two patterns and a destination template
    pub fn new(party_a: &str, party_b: &str, destination: &str) -> Result<Self> {
        let party_b = if party_b.is_empty() { ".*" } else { party_b };
        let pattern = format!("^({})\t({})$", party_a, party_b);
        let regex = RegexBuilder::new(&pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| Error::Other(format!("bad route pattern \"{}\": {}", pattern, e)))?;
        if destination.is_empty() {
            return Err(Error::Other("route entry with empty destination".to_string()));
        }
        Ok(Self {
            party_a: party_a.to_string(),
            party_b: party_b.to_string(),
            destination: destination.to_string(),
            regex,
        })
    }

    /// Parse a configuration line: `A-pattern \t B-pattern = destination`.
    ///
    /// The tab may be literal or the two character escape `\t`. The short
    /// form `scheme:pattern = destination` sets the A pattern and lets the
    /// B pattern default to `.*`.
    pub fn parse(spec: &str) -> Result<Self> {
        let (patterns, destination) = spec
            .split_once('=')
            .ok_or_else(|| Error::Other(format!("route spec \"{}\" has no '='", spec)))?;
        let destination = destination.trim();
        let patterns = patterns.trim();

        let tab_split = patterns
            .split_once('\t')
            .or_else(|| patterns.split_once("\\t"));

        match tab_split {
            Some((a, b)) => Self::new(a.trim(), b.trim(), destination),
            None => Self::new(patterns, ".*", destination),
        }
    }

    /// The destination template
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Whether this entry matches the `a TAB b` search string
    pub fn is_match(&self, search: &str) -> bool {
        let matched = self.regex.is_match(search);
        trace!(
            "{} regex \"{}\" ({})",
            if matched { "Matched" } else { "Did not match" },
            self.regex.as_str(),
            self
        );
        matched
    }
}

impl std::fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\\t{}={}", self.party_a, self.party_b, self.destination)
    }
}

/// Ordered list of route entries
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
}

impl RouteTable {
    /// Empty table; lookups then pass the B party straight through
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry
    pub fn add(&mut self, entry: RouteEntry) {
        debug!("Added route \"{}\"", entry);
        self.entries.push(entry);
    }

    /// Append an entry from a configuration line; `#` lines are comments
    pub fn add_spec(&mut self, spec: &str) -> Result<()> {
        let spec = spec.trim();
        if spec.is_empty() || spec.starts_with('#') {
            return Ok(());
        }
        self.add(RouteEntry::parse(spec)?);
        Ok(())
    }

    /// Replace the whole table
    pub fn set_from_specs(&mut self, specs: &[String]) -> Result<()> {
        self.entries.clear();
        for spec in specs {
            self.add_spec(spec)?;
        }
        Ok(())
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entries are configured
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Translate a party pair to a destination.
    ///
    /// `route_index` persists across calls so a failed destination can
    /// resume the search at the next entry. `scheme_exists` reports
    /// whether an endpoint is registered for a scheme, used by the
    /// backward compatible `<da>` shortcut.
    pub fn apply(
        &self,
        a_party: &str,
        b_party: &str,
        route_index: &mut usize,
        scheme_exists: &dyn Fn(&str) -> bool,
    ) -> Option<String> {
        // Empty table: pass through once, then give up
        if self.entries.is_empty() {
            let first = *route_index == 0;
            *route_index += 1;
            return if first { Some(b_party.to_string()) } else { None };
        }

        let mut search = format!("{}\t{}", a_party, b_party);
        debug!("Searching for route \"{}\"", search.replace('\t', " -> "));

        let mut destination = None;
        let mut restarts = 0;
        while *route_index < self.entries.len() {
            let entry = &self.entries[*route_index];
            *route_index += 1;
            if !entry.is_match(&search) {
                continue;
            }

            let found = entry.destination();
            if found.starts_with("label:") {
                // Restart the search with the label as the new B party
                restarts += 1;
                if restarts > MAX_LABEL_RESTARTS {
                    warn!("Route label loop detected at \"{}\", failing lookup", found);
                    return None;
                }
                search = format!("{}\t{}", a_party, found);
                *route_index = 0;
                continue;
            }

            destination = Some(found.to_string());
            break;
        }

        let destination = destination?;
        Some(expand_destination(&destination, a_party, b_party, scheme_exists))
    }
}

/// Split `scheme:rest` when the scheme looks like one
pub fn split_scheme(party: &str) -> Option<(&str, &str)> {
    let (scheme, rest) = party.split_once(':')?;
    if scheme.is_empty()
        || !scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
    {
        return None;
    }
    Some((scheme, rest))
}

fn expand_destination(
    template: &str,
    a_party: &str,
    b_party: &str,
    scheme_exists: &dyn Fn(&str) -> bool,
) -> String {
    // Backward compatibility: when the template wants the whole B party
    // and the B party already names a routable endpoint, use it verbatim
    if template.contains("<da>") {
        if let Some((scheme, _)) = split_scheme(b_party) {
            if scheme_exists(scheme) {
                return b_party.to_string();
            }
        }
    }

    let after_scheme = split_scheme(b_party).map(|(_, rest)| rest).unwrap_or(b_party);

    // User and non-user parts
    let (user, non_user) = match after_scheme.find('@') {
        Some(at) => (&after_scheme[..at], &after_scheme[at..]),
        None => (after_scheme, ""),
    };

    // Digits and the non-digit remainder; a leading + is tolerated
    let digit_src = after_scheme.strip_prefix('+').unwrap_or(after_scheme);
    let digit_end = digit_src
        .find(|c: char| !DIGIT_CHARS.contains(c))
        .unwrap_or(digit_src.len());
    let digits = &digit_src[..digit_end];
    let non_digits = &digit_src[digit_end..];

    // Calling party user part
    let cu = {
        let rest = split_scheme(a_party).map(|(_, rest)| rest).unwrap_or(a_party);
        rest.split('@').next().unwrap_or("")
    };

    let mut destination = template.to_string();

    // Avoid a double '@' when both template and substitution carry one
    if non_user.contains('@') {
        if let Some(at) = destination.find('@') {
            if let Some(du) = destination[at..].find("<!du>") {
                destination.replace_range(at..at + du, "");
            }
        }
    }

    destination = destination.replace("<da>", b_party);
    destination = destination.replace("<db>", b_party);
    destination = destination.replace("<du>", user);
    destination = destination.replace("<!du>", non_user);
    destination = destination.replace("<cu>", cu);
    destination = destination.replace("<dn>", digits);
    destination = destination.replace("<!dn>", non_digits);

    // <dnN>: the N-th *-separated digit field (1 based)
    let fields: Vec<&str> = digits.split('*').collect();
    for n in 1..=9usize {
        let macro_name = format!("<dn{}>", n);
        if destination.contains(&macro_name) {
            let value = fields.get(n - 1).copied().unwrap_or("");
            destination = destination.replace(&macro_name, value);
        }
    }

    // <dn2ip>: digits as a dotted/starred IP tuple
    while destination.contains("<dn2ip>") {
        let expansion = match fields.len() {
            0..=3 => digits.to_string(),
            4 => format!("{}.{}.{}.{}", fields[0], fields[1], fields[2], fields[3]),
            5 => format!(
                "{}@{}.{}.{}.{}",
                fields[0], fields[1], fields[2], fields[3], fields[4]
            ),
            _ => format!(
                "{}@{}.{}.{}.{}:{}",
                fields[0], fields[1], fields[2], fields[3], fields[4], fields[5]
            ),
        };
        destination = destination.replacen("<dn2ip>", &expansion, 1);
    }

    destination
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_schemes(_: &str) -> bool {
        false
    }

    fn apply(table: &RouteTable, a: &str, b: &str) -> Option<String> {
        let mut index = 0;
        table.apply(a, b, &mut index, &no_schemes)
    }

    fn table(specs: &[&str]) -> RouteTable {
        let mut table = RouteTable::new();
        for spec in specs {
            table.add_spec(spec).unwrap();
        }
        table
    }

    #[test]
    fn test_exact_tab_matching() {
        let entry = RouteEntry::new("x", "y", "pc:*").unwrap();
        assert!(entry.is_match("x\ty"));
        assert!(!entry.is_match("x\tyy"));
        assert!(!entry.is_match("xx\ty"));
        assert!(!entry.is_match("x\ty\t"));
    }

    #[test]
    fn test_empty_table_passthrough_once() {
        let table = RouteTable::new();
        let mut index = 0;
        assert_eq!(
            table.apply("h323:alice", "sip:bob@host", &mut index, &no_schemes),
            Some("sip:bob@host".to_string())
        );
        assert_eq!(table.apply("h323:alice", "sip:bob@host", &mut index, &no_schemes), None);
    }

    #[test]
    fn test_first_match_wins() {
        let table = table(&[
            "h323:.*\t.* = pc:first",
            "h323:.*\t.* = pc:second",
        ]);
        assert_eq!(apply(&table, "h323:alice@1.2.3.4", "anything"), Some("pc:first".to_string()));
    }

    #[test]
    fn test_resume_from_index() {
        let table = table(&[
            "h323:.*\t.* = pc:first",
            "h323:.*\t.* = pc:second",
        ]);
        let mut index = 0;
        table.apply("h323:alice", "x", &mut index, &no_schemes);
        assert_eq!(
            table.apply("h323:alice", "x", &mut index, &no_schemes),
            Some("pc:second".to_string())
        );
    }

    #[test]
    fn test_short_form_spec() {
        let table = table(&["pots:.* = sip:<dn>@gw.example.com"]);
        assert_eq!(
            apply(&table, "pots:1", "5551234"),
            Some("sip:5551234@gw.example.com".to_string())
        );
    }

    #[test]
    fn test_case_insensitive() {
        let table = table(&["H323:.*\t.* = pc:*"]);
        assert_eq!(apply(&table, "h323:alice", "bob"), Some("pc:*".to_string()));
    }

    #[test]
    fn test_macro_du_and_not_du() {
        let table = table(&[".*\t.* = h323:<du><!du>"]);
        assert_eq!(
            apply(&table, "pc:me", "sip:fred@boggs.com"),
            Some("h323:fred@boggs.com".to_string())
        );
    }

    #[test]
    fn test_macro_dn_and_remainder() {
        let table = table(&[".*\t.* = pots:<dn>/<!dn>"]);
        assert_eq!(apply(&table, "pc:me", "5551234xyz"), Some("pots:5551234/xyz".to_string()));
    }

    #[test]
    fn test_macro_dn_allows_plus_prefix() {
        let table = table(&[".*\t.* = sip:<dn>"]);
        assert_eq!(apply(&table, "pc:me", "+49301234"), Some("sip:49301234".to_string()));
    }

    #[test]
    fn test_macro_cu() {
        let table = table(&[".*\t.* = sip:<cu>@proxy"]);
        assert_eq!(apply(&table, "h323:alice@here", "whatever"), Some("sip:alice@proxy".to_string()));
    }

    #[test]
    fn test_macro_dn_fields() {
        let table = table(&[".*\t.* = ivr:<dn2>"]);
        assert_eq!(apply(&table, "pc:me", "12*345*678"), Some("ivr:345".to_string()));
    }

    #[test]
    fn test_dn2ip_four_fields() {
        let table = table(&[".*\t.* = sip:<dn2ip>"]);
        assert_eq!(
            apply(&table, "pots:1", "10*0*0*42"),
            Some("sip:10.0.0.42".to_string())
        );
    }

    #[test]
    fn test_dn2ip_five_and_six_fields() {
        let table = table(&[".*\t.* = sip:<dn2ip>"]);
        assert_eq!(
            apply(&table, "pots:1", "99*10*0*0*42"),
            Some("sip:99@10.0.0.42".to_string())
        );
        assert_eq!(
            apply(&table, "pots:1", "99*10*0*0*42*5070"),
            Some("sip:99@10.0.0.42:5070".to_string())
        );
    }

    #[test]
    fn test_da_uses_endpoint_when_registered() {
        let table = table(&[".*\t.* = h323:<da>"]);
        let mut index = 0;
        let sip_exists = |scheme: &str| scheme == "sip";
        assert_eq!(
            table.apply("pc:me", "sip:bob@host", &mut index, &sip_exists),
            Some("sip:bob@host".to_string())
        );
    }

    #[test]
    fn test_label_redirection() {
        let table = table(&[
            ".*\tlabel:operator = pc:console",
            "pc:.*\t0 = label:operator",
        ]);
        assert_eq!(apply(&table, "pc:me", "0"), Some("pc:console".to_string()));
    }

    #[test]
    fn test_label_loop_fails_closed() {
        let table = table(&[
            ".*\tlabel:a = label:b",
            ".*\tlabel:b = label:a",
            "pc:.*\t9 = label:a",
        ]);
        assert_eq!(apply(&table, "pc:me", "9"), None);
    }

    #[test]
    fn test_no_match_returns_none() {
        let table = table(&["h323:.*\t.* = pc:*"]);
        assert_eq!(apply(&table, "sip:me", "anything"), None);
    }

    #[test]
    fn test_comments_and_blanks_skipped() {
        let mut table = RouteTable::new();
        table.add_spec("# a comment").unwrap();
        table.add_spec("").unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn test_scheme_splitting() {
        assert_eq!(split_scheme("sip:bob@host"), Some(("sip", "bob@host")));
        assert_eq!(split_scheme("h323:1.2.3.4"), Some(("h323", "1.2.3.4")));
        assert_eq!(split_scheme("no-scheme-here"), None);
        assert_eq!(split_scheme(":empty"), None);
    }
}
