//! The canonical UUID shape shared by the three storage UUID namespaces.

/// Lengths of the hex groups of an 8-4-4-4-12 UUID.
const GROUP_LENS: [usize; 5] = [8, 4, 4, 4, 12];

/// Check for the canonical 8-4-4-4-12 hex UUID shape.
pub fn validate_uuid(input: &str) -> bool {
    let groups: Vec<&str> = input.split('-').collect();
    groups.len() == GROUP_LENS.len()
        && groups
            .iter()
            .zip(GROUP_LENS)
            .all(|(group, len)| group.len() == len && group.chars().all(|c| c.is_ascii_hexdigit()))
}
