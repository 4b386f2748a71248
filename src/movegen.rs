//! Move generation, legality filtering and move execution.
//!
//! The engine works in four layers:
//!
//! - **Pseudo-legal generation**: per-piece movement rules, including
//!   en passant and castling candidates, ignorant of check.
//! - **Legality filter**: each candidate is played on the board with a
//!   make/unmake pair and rejected if it leaves the mover's king attacked.
//!   Castling additionally requires every square the king stands on or
//!   passes through to be safe.
//! - **Executor**: commits an already-validated move, handling the rook
//!   jump, the en passant removal and promotion.
//! - **Terminal-state detection**: check, checkmate and stalemate.

use crate::error::{GameError, GameResult};
use crate::types::*;

/// Direction vectors for sliding pieces.
const ROOK_DIRS: [(i8, i8); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];
const BISHOP_DIRS: [(i8, i8); 4] = [(-1, -1), (-1, 1), (1, -1), (1, 1)];
const QUEEN_DIRS: [(i8, i8); 8] = [
    (-1, 0), (1, 0), (0, -1), (0, 1),
    (-1, -1), (-1, 1), (1, -1), (1, 1),
];

const KNIGHT_OFFSETS: [(i8, i8); 8] = [
    (-2, -1), (-2, 1), (-1, -2), (-1, 2),
    (1, -2), (1, 2), (2, -1), (2, 1),
];

/// File the king starts on, for both colors.
const KING_HOME_FILE: u8 = 4;

// ---------------------------------------------------------------------------
// Attack detection
// ---------------------------------------------------------------------------

/// Movement predicate without castling: can `piece` standing on `from`
/// strike `target`? Pawns only strike diagonally forward.
pub fn attacks(board: &Board, from: Square, piece: Piece, target: Square) -> bool {
    if from == target {
        return false;
    }
    let df = target.file as i8 - from.file as i8;
    let dr = target.rank as i8 - from.rank as i8;

    match piece.kind {
        PieceKind::Pawn => dr == piece.color.pawn_direction() && df.abs() == 1,
        PieceKind::Knight => matches!((df.abs(), dr.abs()), (1, 2) | (2, 1)),
        PieceKind::King => df.abs() <= 1 && dr.abs() <= 1,
        PieceKind::Rook => (df == 0 || dr == 0) && path_clear(board, from, target),
        PieceKind::Bishop => df.abs() == dr.abs() && path_clear(board, from, target),
        PieceKind::Queen => {
            (df == 0 || dr == 0 || df.abs() == dr.abs()) && path_clear(board, from, target)
        }
    }
}

/// Returns `true` if every square strictly between `from` and `to` is empty.
/// The two squares must share a rank, file or diagonal.
fn path_clear(board: &Board, from: Square, to: Square) -> bool {
    let step_f = (to.file as i8 - from.file as i8).signum();
    let step_r = (to.rank as i8 - from.rank as i8).signum();

    let mut cur = from.offset(step_f, step_r);
    while let Some(sq) = cur {
        if sq == to {
            return true;
        }
        if board.get(sq).is_some() {
            return false;
        }
        cur = sq.offset(step_f, step_r);
    }
    false
}

/// Returns `true` if the given square is attacked by any piece of `attacker_color`.
///
/// Scans every square for an attacker and asks [`attacks`] whether it
/// reaches the target.
pub fn is_square_attacked(board: &Board, sq: Square, attacker_color: Color) -> bool {
    board
        .pieces_of(attacker_color)
        .any(|(from, piece)| attacks(board, from, piece, sq))
}

/// Returns `true` if the king of the given color is currently in check.
pub fn is_king_in_check(board: &Board, color: Color) -> bool {
    match board.find_king(color) {
        Some(king_sq) => is_square_attacked(board, king_sq, color.opponent()),
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Pseudo-legal move generation (before check filtering)
// ---------------------------------------------------------------------------

/// Generates pseudo-legal destinations for the piece on `from`.
///
/// Returns an empty list if `from` is empty or holds a piece of the other
/// side. The moves follow piece movement rules but may leave the own king
/// in check.
pub fn pseudo_legal_destinations(pos: &Position, color: Color, from: Square) -> Vec<Square> {
    let mut moves = Vec::with_capacity(28);
    let piece = match pos.board.get(from) {
        Some(p) if p.color == color => p,
        _ => return moves,
    };

    match piece.kind {
        PieceKind::King => generate_king_moves(pos, from, color, &mut moves),
        PieceKind::Queen => generate_sliding_moves(&pos.board, from, color, &QUEEN_DIRS, &mut moves),
        PieceKind::Rook => generate_sliding_moves(&pos.board, from, color, &ROOK_DIRS, &mut moves),
        PieceKind::Bishop => generate_sliding_moves(&pos.board, from, color, &BISHOP_DIRS, &mut moves),
        PieceKind::Knight => generate_knight_moves(&pos.board, from, color, &mut moves),
        PieceKind::Pawn => generate_pawn_moves(pos, from, color, &mut moves),
    }

    moves
}

/// Generates sliding piece moves (rook, bishop, queen).
fn generate_sliding_moves(
    board: &Board,
    from: Square,
    color: Color,
    directions: &[(i8, i8)],
    moves: &mut Vec<Square>,
) {
    for &(df, dr) in directions {
        let mut cur = from;
        while let Some(to) = cur.offset(df, dr) {
            match board.get(to) {
                None => {
                    moves.push(to);
                    cur = to;
                }
                Some(target) => {
                    if target.color != color {
                        moves.push(to); // capture
                    }
                    break; // blocked
                }
            }
        }
    }
}

/// Generates knight moves.
fn generate_knight_moves(board: &Board, from: Square, color: Color, moves: &mut Vec<Square>) {
    for &(df, dr) in &KNIGHT_OFFSETS {
        if let Some(to) = from.offset(df, dr)
            && board.get(to).is_none_or(|target| target.color != color)
        {
            moves.push(to);
        }
    }
}

/// Generates king moves, plus castling candidates from the home square.
fn generate_king_moves(pos: &Position, from: Square, color: Color, moves: &mut Vec<Square>) {
    for df in -1..=1i8 {
        for dr in -1..=1i8 {
            if df == 0 && dr == 0 {
                continue;
            }
            if let Some(to) = from.offset(df, dr)
                && pos.board.get(to).is_none_or(|target| target.color != color)
            {
                moves.push(to);
            }
        }
    }

    let rank = color.home_rank();
    if from != Square::new(KING_HOME_FILE, rank) {
        return;
    }

    let rights = pos.castling.for_color(color);
    for (side, allowed) in [
        (CastlingSide::Kingside, rights.kingside),
        (CastlingSide::Queenside, rights.queenside),
    ] {
        if !allowed {
            continue;
        }
        let geometry = CastlingGeometry::for_side(side);

        let rook_present = pos.board.get(Square::new(geometry.rook_from, rank))
            == Some(Piece::new(PieceKind::Rook, color));
        let corridor_empty = geometry
            .corridor
            .iter()
            .all(|&file| pos.board.get(Square::new(file, rank)).is_none());

        if rook_present && corridor_empty {
            moves.push(Square::new(geometry.king_to, rank));
        }
    }
}

/// Generates pawn moves (pushes, captures, en passant).
fn generate_pawn_moves(pos: &Position, from: Square, color: Color, moves: &mut Vec<Square>) {
    let dir = color.pawn_direction();

    // Single step forward
    if let Some(one_ahead) = from.offset(0, dir)
        && pos.board.get(one_ahead).is_none()
    {
        moves.push(one_ahead);

        // Double step from starting rank
        if from.rank == color.pawn_start_rank()
            && let Some(two_ahead) = from.offset(0, dir * 2)
            && pos.board.get(two_ahead).is_none()
        {
            moves.push(two_ahead);
        }
    }

    // Diagonal captures
    for df in [-1i8, 1] {
        if let Some(to) = from.offset(df, dir) {
            match pos.board.get(to) {
                Some(target) if target.color != color => moves.push(to),
                None if pos.en_passant == Some(to) => moves.push(to),
                _ => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Castling geometry
// ---------------------------------------------------------------------------

/// Files involved in castling to one side.
struct CastlingGeometry {
    king_to: u8,
    rook_from: u8,
    rook_to: u8,
    /// Squares between king and rook that must be empty.
    corridor: &'static [u8],
}

impl CastlingGeometry {
    fn for_side(side: CastlingSide) -> Self {
        match side {
            CastlingSide::Kingside => Self {
                king_to: 6,
                rook_from: 7,
                rook_to: 5,
                corridor: &[5, 6],
            },
            CastlingSide::Queenside => Self {
                king_to: 2,
                rook_from: 0,
                rook_to: 3,
                corridor: &[1, 2, 3],
            },
        }
    }
}

/// Returns the castling side if a king move from `from` to `to` is a
/// two-file jump along its rank.
fn castling_side(from: Square, to: Square) -> Option<CastlingSide> {
    if from.rank != to.rank {
        return None;
    }
    match to.file as i8 - from.file as i8 {
        2 => Some(CastlingSide::Kingside),
        -2 => Some(CastlingSide::Queenside),
        _ => None,
    }
}

/// Square of the pawn that a move from `from` to `to` would take en passant.
fn en_passant_victim(pos: &Position, piece: Piece, from: Square, to: Square) -> Option<Square> {
    let is_ep = piece.kind == PieceKind::Pawn
        && from.file != to.file
        && pos.board.get(to).is_none()
        && pos.en_passant == Some(to);
    is_ep.then(|| Square::new(to.file, from.rank))
}

// ---------------------------------------------------------------------------
// Legality filter
// ---------------------------------------------------------------------------

/// Plays the move on the board, tests the mover's king, and takes it back.
fn leaves_king_safe(board: &mut Board, color: Color, from: Square, to: Square, lift: Option<Square>) -> bool {
    let Some(undo) = board.make(from, to, lift) else {
        return false;
    };
    let safe = !is_king_in_check(board, color);
    board.unmake(undo);
    safe
}

/// The king may not castle out of, through, or into check. Each square is
/// tested with the king notionally standing on it.
fn castling_path_is_safe(board: &mut Board, color: Color, from: Square, to: Square) -> bool {
    let enemy = color.opponent();
    if is_square_attacked(board, from, enemy) {
        return false;
    }

    let step = (to.file as i8 - from.file as i8).signum();
    let mut cur = from;
    while cur != to {
        let Some(next) = cur.offset(step, 0) else {
            return false;
        };
        let Some(undo) = board.make(from, next, None) else {
            return false;
        };
        let attacked = is_square_attacked(board, next, enemy);
        board.unmake(undo);
        if attacked {
            return false;
        }
        cur = next;
    }
    true
}

/// Second stage of legality for a pseudo-legal candidate.
fn passes_filter(pos: &mut Position, color: Color, piece: Piece, from: Square, to: Square) -> bool {
    if piece.kind == PieceKind::King && castling_side(from, to).is_some() {
        return castling_path_is_safe(&mut pos.board, color, from, to);
    }
    let lift = en_passant_victim(pos, piece, from, to);
    leaves_king_safe(&mut pos.board, color, from, to, lift)
}

/// Generates the legal destinations for the piece on `from`.
///
/// The board is temporarily modified while candidates are tested, and is
/// identical to its original state when this returns.
pub fn legal_destinations(pos: &mut Position, color: Color, from: Square) -> Vec<Square> {
    let Some(piece) = pos.board.get(from) else {
        return Vec::new();
    };
    pseudo_legal_destinations(pos, color, from)
        .into_iter()
        .filter(|&to| passes_filter(pos, color, piece, from, to))
        .collect()
}

/// Returns `true` if moving `from` → `to` is legal for `color`.
pub fn is_legal_move(pos: &mut Position, color: Color, from: Square, to: Square) -> bool {
    let Some(piece) = pos.board.get(from) else {
        return false;
    };
    piece.color == color
        && pseudo_legal_destinations(pos, color, from).contains(&to)
        && passes_filter(pos, color, piece, from, to)
}

/// Generates every legal (from, to) pair for `color`.
pub fn legal_moves(pos: &mut Position, color: Color) -> Vec<(Square, Square)> {
    let origins: Vec<Square> = pos.board.pieces_of(color).map(|(sq, _)| sq).collect();
    origins
        .into_iter()
        .flat_map(|from| {
            legal_destinations(pos, color, from)
                .into_iter()
                .map(move |to| (from, to))
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Returns `true` as soon as one legal move for `color` is found.
pub fn has_any_legal_move(pos: &mut Position, color: Color) -> bool {
    let origins: Vec<(Square, Piece)> = pos.board.pieces_of(color).collect();
    origins.into_iter().any(|(from, piece)| {
        pseudo_legal_destinations(pos, color, from)
            .into_iter()
            .any(|to| passes_filter(pos, color, piece, from, to))
    })
}

// ---------------------------------------------------------------------------
// Terminal-state detection
// ---------------------------------------------------------------------------

/// `color` is in check and has no legal move.
pub fn is_checkmate(pos: &mut Position, color: Color) -> bool {
    is_king_in_check(&pos.board, color) && !has_any_legal_move(pos, color)
}

/// `color` is not in check and has no legal move.
pub fn is_stalemate(pos: &mut Position, color: Color) -> bool {
    !is_king_in_check(&pos.board, color) && !has_any_legal_move(pos, color)
}

// ---------------------------------------------------------------------------
// Move execution
// ---------------------------------------------------------------------------

/// Commits a move that already passed [`is_legal_move`].
///
/// This handles:
/// - Normal moves and captures
/// - Castling (moves both king and rook)
/// - En passant (removes the captured pawn)
/// - Promotion to the requested piece, queen when none was requested
///
/// Castling rights and the en passant target are updated for the next ply.
pub fn execute_move(
    pos: &mut Position,
    from: Square,
    to: Square,
    promotion: Option<PieceKind>,
) -> GameResult<MoveDescriptor> {
    let piece = pos
        .board
        .get(from)
        .ok_or_else(|| GameError::Internal(format!("no piece on {from}")))?;

    let mut captured = pos.board.get(to);
    let mut special_move = None;

    if let Some(victim_sq) = en_passant_victim(pos, piece, from, to) {
        let victim = pos
            .board
            .get(victim_sq)
            .ok_or_else(|| GameError::Internal(format!("no pawn to take en passant on {victim_sq}")))?;
        pos.board.set(victim_sq, None);
        captured = Some(victim);
        special_move = Some(SpecialMove::EnPassant {
            captured_square: victim_sq,
            captured_piece: victim,
        });
    }

    pos.board.set(from, None);
    pos.board.set(to, Some(piece));

    if piece.kind == PieceKind::King
        && let Some(side) = castling_side(from, to)
    {
        let geometry = CastlingGeometry::for_side(side);
        let rook_from = Square::new(geometry.rook_from, from.rank);
        let rook_to = Square::new(geometry.rook_to, from.rank);
        let rook = pos.board.get(rook_from);
        pos.board.set(rook_from, None);
        pos.board.set(rook_to, rook);
        special_move = Some(SpecialMove::Castling {
            side,
            rook_from,
            rook_to,
        });
    }

    let promotion = if piece.kind == PieceKind::Pawn && to.rank == piece.color.promotion_rank() {
        let kind = match promotion {
            Some(kind @ (PieceKind::Queen | PieceKind::Rook | PieceKind::Bishop | PieceKind::Knight)) => kind,
            _ => PieceKind::Queen,
        };
        pos.board.set(to, Some(Piece::new(kind, piece.color)));
        Some(kind)
    } else {
        None
    };

    if piece.kind == PieceKind::King {
        let rights = pos.castling.for_color_mut(piece.color);
        rights.kingside = false;
        rights.queenside = false;
    }
    pos.castling.revoke_corner(from);
    pos.castling.revoke_corner(to);

    pos.en_passant = None;
    if piece.kind == PieceKind::Pawn && (to.rank as i8 - from.rank as i8).abs() == 2 {
        let skipped = (from.rank as i8 + piece.color.pawn_direction()) as u8;
        pos.en_passant = Some(Square::new(from.file, skipped));
    }

    Ok(MoveDescriptor {
        from,
        to,
        piece,
        captured,
        promotion,
        special_move,
    })
}
