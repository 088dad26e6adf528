use crate::array_utils::wrap_index;

fn coord_to_row_maj_index(coords: &[isize; 2], dims: &[usize; 2]) -> usize {
    wrap_index(coords[0], dims[0]) * dims[1] + wrap_index(coords[1], dims[1])
}

fn row_maj_index_to_coord(idx: usize, dims: &[usize; 2]) -> [isize; 2] {
    [(idx / dims[1]) as isize, (idx % dims[1]) as isize]
}

/// circularly shifts a row-major 2-D plane in-place. Element (i, j) moves to (i + shift[0], j + shift[1])
pub fn circshift2<T: Copy>(dims: &[usize; 2], shift: &[isize; 2], data: &mut [T]) {
    assert_eq!(dims.iter().product::<usize>(), data.len(), "dims and source size must agree");
    let result = (0..data.len())
        .map(|final_idx| {
            let mut coord = row_maj_index_to_coord(final_idx, dims);
            // reverse the shift to find the source coordinate
            coord.iter_mut().zip(shift).for_each(|(c, s)| *c -= s);
            data[coord_to_row_maj_index(&coord, dims)]
        })
        .collect::<Vec<_>>();
    data.copy_from_slice(&result);
}

/// forward fft shift of a row-maj ordered plane (moves DC from index 0 to n/2)
pub fn fftshift2<T: Copy>(dims: &[usize; 2], data: &mut [T]) {
    let shift = [(dims[0] / 2) as isize, (dims[1] / 2) as isize];
    circshift2(dims, &shift, data);
}

/// inverse fft shift of a row-maj ordered plane
pub fn ifftshift2<T: Copy>(dims: &[usize; 2], data: &mut [T]) {
    let shift = [((dims[0] + 1) / 2) as isize, ((dims[1] + 1) / 2) as isize];
    circshift2(dims, &shift, data);
}
