//! Covalent topology and polarization groups.
//!
//! Masking of pair interactions needs the 1-2 through 1-5 covalent relations
//! of every atom, and polarization masking additionally needs the
//! polarization groups: connected sets of atoms grown over bonds whose types
//! appear in each other's group lists. `ip11` holds the atoms of the group
//! itself, `ip12` the atoms of directly bonded groups, and `ip13` the atoms
//! of groups two group-bonds away.

use itertools::Itertools;

use super::atom::Atom;

#[derive(Debug, Clone)]
pub struct Topology {
    n12: Vec<Vec<usize>>,
    n13: Vec<Vec<usize>>,
    n14: Vec<Vec<usize>>,
    n15: Vec<Vec<usize>>,
    ip11: Vec<Vec<usize>>,
    ip12: Vec<Vec<usize>>,
    ip13: Vec<Vec<usize>>,
}

impl Topology {
    pub fn new(n_atoms: usize, bonds: &[(usize, usize)], atoms: &[Atom]) -> Self {
        let n12 = bonded_neighbors(n_atoms, bonds);
        let n13 = walk_from(&n12, &n12, &[&n12]);
        let n14 = walk_from(&n13, &n12, &[&n12, &n13]);
        let n15 = walk_from(&n14, &n12, &[&n12, &n13, &n14]);
        let (ip11, ip12, ip13) = polarization_groups(n_atoms, &n12, atoms);
        Self {
            n12,
            n13,
            n14,
            n15,
            ip11,
            ip12,
            ip13,
        }
    }

    pub fn n12(&self, i: usize) -> &[usize] {
        &self.n12[i]
    }

    pub fn n13(&self, i: usize) -> &[usize] {
        &self.n13[i]
    }

    pub fn n14(&self, i: usize) -> &[usize] {
        &self.n14[i]
    }

    pub fn n15(&self, i: usize) -> &[usize] {
        &self.n15[i]
    }

    pub fn ip11(&self, i: usize) -> &[usize] {
        &self.ip11[i]
    }

    pub fn ip12(&self, i: usize) -> &[usize] {
        &self.ip12[i]
    }

    pub fn ip13(&self, i: usize) -> &[usize] {
        &self.ip13[i]
    }
}

fn bonded_neighbors(n_atoms: usize, bonds: &[(usize, usize)]) -> Vec<Vec<usize>> {
    let mut n12 = vec![Vec::new(); n_atoms];
    for &(a, b) in bonds {
        n12[a].push(b);
        n12[b].push(a);
    }
    for list in n12.iter_mut() {
        list.sort_unstable();
        list.dedup();
    }
    n12
}

/// One covalent step outward from `from`, excluding the origin atom and any
/// atom already in a closer shell.
fn walk_from(from: &[Vec<usize>], n12: &[Vec<usize>], closer: &[&Vec<Vec<usize>>]) -> Vec<Vec<usize>> {
    from.iter()
        .enumerate()
        .map(|(i, shell)| {
            shell
                .iter()
                .flat_map(|&j| n12[j].iter().copied())
                .filter(|&k| k != i)
                .filter(|&k| !closer.iter().any(|lists| lists[i].contains(&k)))
                .sorted_unstable()
                .dedup()
                .collect()
        })
        .collect()
}

/// Grows the 1-1 polarization groups over bonds, then derives the 1-2 and
/// 1-3 group relations.
fn polarization_groups(
    n_atoms: usize,
    n12: &[Vec<usize>],
    atoms: &[Atom],
) -> (Vec<Vec<usize>>, Vec<Vec<usize>>, Vec<Vec<usize>>) {
    // Group id per atom via depth-first growth: a bonded neighbor joins the
    // group when its type appears in the current atom's group list.
    let mut group_of = vec![usize::MAX; n_atoms];
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for seed in 0..n_atoms {
        if group_of[seed] != usize::MAX {
            continue;
        }
        let id = groups.len();
        let mut members = vec![seed];
        group_of[seed] = id;
        let mut stack = vec![seed];
        while let Some(current) = stack.pop() {
            for &j in &n12[current] {
                if group_of[j] == usize::MAX
                    && atoms[current].group_types.contains(&atoms[j].type_id)
                {
                    group_of[j] = id;
                    members.push(j);
                    stack.push(j);
                }
            }
        }
        members.sort_unstable();
        groups.push(members);
    }

    let ip11: Vec<Vec<usize>> = (0..n_atoms).map(|i| groups[group_of[i]].clone()).collect();

    // Group adjacency: two groups are 1-2 when any bond crosses them.
    let n_groups = groups.len();
    let mut adjacent = vec![Vec::new(); n_groups];
    for (a, neighbors) in n12.iter().enumerate() {
        for &b in neighbors {
            let (ga, gb) = (group_of[a], group_of[b]);
            if ga != gb {
                adjacent[ga].push(gb);
            }
        }
    }
    for list in adjacent.iter_mut() {
        list.sort_unstable();
        list.dedup();
    }

    let members_of = |ids: &[usize]| -> Vec<usize> {
        ids.iter()
            .flat_map(|&g| groups[g].iter().copied())
            .sorted_unstable()
            .dedup()
            .collect()
    };

    let mut ip12 = Vec::with_capacity(n_atoms);
    let mut ip13 = Vec::with_capacity(n_atoms);
    for i in 0..n_atoms {
        let g = group_of[i];
        let near: Vec<usize> = adjacent[g].clone();
        let far: Vec<usize> = near
            .iter()
            .flat_map(|&h| adjacent[h].iter().copied())
            .filter(|&f| f != g && !near.contains(&f))
            .sorted_unstable()
            .dedup()
            .collect();
        ip12.push(members_of(&near));
        ip13.push(members_of(&far));
    }
    (ip11, ip12, ip13)
}
