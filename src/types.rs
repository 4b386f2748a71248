//! Core types for the chess-duel session server.
//!
//! This module defines the board model shared by the legality engine and
//! the session state machine: colors, tagged pieces, squares, castling
//! rights, the 8×8 board with its make/unmake helpers, and the move
//! descriptor reported for every committed move.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use utoipa::ToSchema;

// ---------------------------------------------------------------------------
// Piece & Color
// ---------------------------------------------------------------------------

/// Represents the color (side) of a chess piece or player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    /// The White side (starts on ranks 1–2).
    White,
    /// The Black side (starts on ranks 7–8).
    Black,
}

impl Color {
    /// Returns the opposite color.
    pub fn opponent(self) -> Color {
        match self {
            Color::White => Color::Black,
            Color::Black => Color::White,
        }
    }

    /// Returns the back rank index (0-based) where the king and rooks start.
    pub fn home_rank(self) -> u8 {
        match self {
            Color::White => 0,
            Color::Black => 7,
        }
    }

    /// Returns the home rank index (0-based) for pawns of this color.
    /// White pawns start on rank 2 (index 1), Black on rank 7 (index 6).
    pub fn pawn_start_rank(self) -> u8 {
        match self {
            Color::White => 1,
            Color::Black => 6,
        }
    }

    /// Returns the promotion rank index (0-based).
    /// White promotes on rank 8 (index 7), Black on rank 1 (index 0).
    pub fn promotion_rank(self) -> u8 {
        match self {
            Color::White => 7,
            Color::Black => 0,
        }
    }

    /// Returns the direction pawns move: +1 for White, -1 for Black.
    pub fn pawn_direction(self) -> i8 {
        match self {
            Color::White => 1,
            Color::Black => -1,
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Color::White => write!(f, "white"),
            Color::Black => write!(f, "black"),
        }
    }
}

/// Represents a chess piece type (without color information).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum PieceKind {
    King,
    Queen,
    Rook,
    Bishop,
    Knight,
    Pawn,
}

impl PieceKind {
    /// Parses a client-supplied promotion choice.
    ///
    /// Accepts the single letters `Q`, `R`, `B`, `N` (either case) and the
    /// full lowercase names. Kings and pawns are never valid promotions.
    pub fn from_promotion_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "q" | "queen" => Some(PieceKind::Queen),
            "r" | "rook" => Some(PieceKind::Rook),
            "b" | "bishop" => Some(PieceKind::Bishop),
            "n" | "knight" => Some(PieceKind::Knight),
            _ => None,
        }
    }
}

/// A chess piece with both kind and color.
///
/// Serialized as `{"type": "pawn", "color": "white"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct Piece {
    #[serde(rename = "type")]
    pub kind: PieceKind,
    pub color: Color,
}

impl Piece {
    /// Creates a new piece.
    pub fn new(kind: PieceKind, color: Color) -> Self {
        Self { kind, color }
    }

    /// Converts the piece to its FEN character representation.
    /// Uppercase for White, lowercase for Black.
    pub fn to_fen_char(self) -> char {
        let c = match self.kind {
            PieceKind::King => 'K',
            PieceKind::Queen => 'Q',
            PieceKind::Rook => 'R',
            PieceKind::Bishop => 'B',
            PieceKind::Knight => 'N',
            PieceKind::Pawn => 'P',
        };
        match self.color {
            Color::White => c,
            Color::Black => c.to_ascii_lowercase(),
        }
    }
}

// ---------------------------------------------------------------------------
// Square
// ---------------------------------------------------------------------------

/// Represents a square on the chessboard using 0-based file and rank indices.
///
/// - `file`: 0 (a) to 7 (h)
/// - `rank`: 0 (rank 1) to 7 (rank 8)
///
/// On the wire a square is always its algebraic name (`"e4"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Square {
    pub file: u8,
    pub rank: u8,
}

impl Square {
    /// Creates a new square from 0-based file and rank.
    pub fn new(file: u8, rank: u8) -> Self {
        debug_assert!(file < 8 && rank < 8, "Square out of bounds");
        Self { file, rank }
    }

    /// Parses an algebraic notation string (e.g. "e4") into a `Square`.
    /// Returns `None` for invalid input.
    pub fn from_algebraic(s: &str) -> Option<Self> {
        let bytes = s.as_bytes();
        if bytes.len() != 2 {
            return None;
        }
        let file = bytes[0].wrapping_sub(b'a');
        let rank = bytes[1].wrapping_sub(b'1');
        if file < 8 && rank < 8 {
            Some(Square { file, rank })
        } else {
            None
        }
    }

    /// Converts the square to its algebraic notation string (e.g. "e4").
    pub fn to_algebraic(self) -> String {
        format!("{}{}", (b'a' + self.file) as char, self.rank + 1)
    }

    /// Returns a new square offset by `(df, dr)`, or `None` if out of bounds.
    pub fn offset(self, df: i8, dr: i8) -> Option<Square> {
        let f = self.file as i8 + df;
        let r = self.rank as i8 + dr;
        if (0..8).contains(&f) && (0..8).contains(&r) {
            Some(Square::new(f as u8, r as u8))
        } else {
            None
        }
    }

    /// Returns a flat index (0..63) for the square.
    pub fn index(self) -> usize {
        (self.rank as usize) * 8 + self.file as usize
    }

    /// Iterates over all 64 squares, rank by rank starting at a1.
    pub fn all() -> impl Iterator<Item = Square> {
        (0..8u8).flat_map(|rank| (0..8u8).map(move |file| Square::new(file, rank)))
    }
}

impl fmt::Display for Square {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_algebraic())
    }
}

impl Serialize for Square {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_algebraic())
    }
}

impl<'de> Deserialize<'de> for Square {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Square::from_algebraic(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid square: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Castling Rights
// ---------------------------------------------------------------------------

/// Castling rights for one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct SideCastlingRights {
    /// Whether kingside castling (short castling) is still available.
    pub kingside: bool,
    /// Whether queenside castling (long castling) is still available.
    pub queenside: bool,
}

impl Default for SideCastlingRights {
    fn default() -> Self {
        Self {
            kingside: true,
            queenside: true,
        }
    }
}

/// Castling rights for both sides.
///
/// Rights are only ever revoked during a game; a rook that leaves its corner
/// and comes back does not restore them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct CastlingRights {
    pub white: SideCastlingRights,
    pub black: SideCastlingRights,
}

impl CastlingRights {
    /// Returns the castling rights for the given color.
    pub fn for_color(&self, color: Color) -> &SideCastlingRights {
        match color {
            Color::White => &self.white,
            Color::Black => &self.black,
        }
    }

    /// Returns a mutable reference to the castling rights for the given color.
    pub fn for_color_mut(&mut self, color: Color) -> &mut SideCastlingRights {
        match color {
            Color::White => &mut self.white,
            Color::Black => &mut self.black,
        }
    }

    /// Rights with nothing left, for hand-built positions.
    pub fn none() -> Self {
        let side = SideCastlingRights {
            kingside: false,
            queenside: false,
        };
        Self {
            white: side,
            black: side,
        }
    }

    /// Revokes whatever right is tied to a rook corner, if `sq` is one.
    pub fn revoke_corner(&mut self, sq: Square) {
        for color in [Color::White, Color::Black] {
            if sq.rank != color.home_rank() {
                continue;
            }
            let rights = self.for_color_mut(color);
            match sq.file {
                0 => rights.queenside = false,
                7 => rights.kingside = false,
                _ => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Board
// ---------------------------------------------------------------------------

/// Represents the chess board as a flat 64-element array.
///
/// Each element is `Option<Piece>`; `None` means the square is empty.
/// Index mapping: `rank * 8 + file` (both 0-based).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Board {
    pub squares: [Option<Piece>; 64],
}

impl Default for Board {
    /// Returns an empty board.
    fn default() -> Self {
        Self {
            squares: [None; 64],
        }
    }
}

/// Everything needed to take back a relocation made with [`Board::make`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Undo {
    from: Square,
    to: Square,
    moved: Piece,
    captured: Option<Piece>,
    removed: Option<(Square, Piece)>,
}

impl Board {
    /// Returns the piece at the given square, if any.
    pub fn get(&self, sq: Square) -> Option<Piece> {
        self.squares[sq.index()]
    }

    /// Sets (or clears) the piece at the given square.
    pub fn set(&mut self, sq: Square, piece: Option<Piece>) {
        self.squares[sq.index()] = piece;
    }

    /// Creates the standard starting position.
    pub fn starting_position() -> Self {
        let mut board = Board::default();
        let back_rank = [
            PieceKind::Rook,
            PieceKind::Knight,
            PieceKind::Bishop,
            PieceKind::Queen,
            PieceKind::King,
            PieceKind::Bishop,
            PieceKind::Knight,
            PieceKind::Rook,
        ];

        for color in [Color::White, Color::Black] {
            for (file, kind) in back_rank.iter().enumerate() {
                board.set(
                    Square::new(file as u8, color.home_rank()),
                    Some(Piece::new(*kind, color)),
                );
                board.set(
                    Square::new(file as u8, color.pawn_start_rank()),
                    Some(Piece::new(PieceKind::Pawn, color)),
                );
            }
        }

        board
    }

    /// Converts the board to the snapshot map format (only occupied squares).
    pub fn to_map(&self) -> BTreeMap<String, Piece> {
        Square::all()
            .filter_map(|sq| self.get(sq).map(|piece| (sq.to_algebraic(), piece)))
            .collect()
    }

    /// Finds the king square for the given color.
    /// Returns `None` if the king is not on the board. (Should never happen in a legal game.)
    pub fn find_king(&self, color: Color) -> Option<Square> {
        Square::all().find(|&sq| self.get(sq) == Some(Piece::new(PieceKind::King, color)))
    }

    /// Iterates over the squares occupied by pieces of `color`.
    pub fn pieces_of(&self, color: Color) -> impl Iterator<Item = (Square, Piece)> + '_ {
        Square::all().filter_map(move |sq| match self.get(sq) {
            Some(piece) if piece.color == color => Some((sq, piece)),
            _ => None,
        })
    }

    /// Relocates the piece on `from` to `to`, optionally lifting a second
    /// piece (the pawn taken en passant). Returns `None` if `from` is empty.
    ///
    /// The returned [`Undo`] must be passed to [`Board::unmake`] before any
    /// other mutation of the board.
    pub fn make(&mut self, from: Square, to: Square, lift: Option<Square>) -> Option<Undo> {
        let moved = self.get(from)?;
        let captured = self.get(to);
        let removed = lift.and_then(|sq| self.get(sq).map(|piece| (sq, piece)));
        if let Some((sq, _)) = removed {
            self.set(sq, None);
        }
        self.set(from, None);
        self.set(to, Some(moved));
        Some(Undo {
            from,
            to,
            moved,
            captured,
            removed,
        })
    }

    /// Restores the board to the state before the matching [`Board::make`].
    pub fn unmake(&mut self, undo: Undo) {
        self.set(undo.to, undo.captured);
        self.set(undo.from, Some(undo.moved));
        if let Some((sq, piece)) = undo.removed {
            self.set(sq, Some(piece));
        }
    }
}

impl fmt::Display for Board {
    /// Plain ASCII diagram from White's point of view.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  +-----------------+")?;
        for rank in (0..8u8).rev() {
            write!(f, "{} |", rank + 1)?;
            for file in 0..8u8 {
                let c = self
                    .get(Square::new(file, rank))
                    .map(Piece::to_fen_char)
                    .unwrap_or('.');
                write!(f, " {c}")?;
            }
            writeln!(f, " |")?;
        }
        writeln!(f, "  +-----------------+")?;
        write!(f, "    a b c d e f g h")
    }
}

/// A board together with the history-dependent state the rules need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub board: Board,
    pub castling: CastlingRights,
    /// Square a pawn skipped over on the immediately preceding ply.
    pub en_passant: Option<Square>,
}

impl Position {
    /// The standard starting position with full castling rights.
    pub fn starting() -> Self {
        Self::from_board(Board::starting_position(), CastlingRights::default())
    }

    /// Wraps a hand-built board; no en passant capture is available.
    pub fn from_board(board: Board, castling: CastlingRights) -> Self {
        Self {
            board,
            castling,
            en_passant: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Move descriptor
// ---------------------------------------------------------------------------

/// Which wing a castling move went to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum CastlingSide {
    Kingside,
    Queenside,
}

/// Side effects of a move beyond relocating the moving piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SpecialMove {
    /// King moved two files; the rook jumped over it.
    Castling {
        side: CastlingSide,
        #[schema(value_type = String)]
        rook_from: Square,
        #[schema(value_type = String)]
        rook_to: Square,
    },
    /// Pawn captured a pawn that had just double-stepped past it.
    EnPassant {
        #[schema(value_type = String)]
        captured_square: Square,
        captured_piece: Piece,
    },
}

/// What the executor reports for every committed move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct MoveDescriptor {
    #[schema(value_type = String)]
    pub from: Square,
    #[schema(value_type = String)]
    pub to: Square,
    /// The piece as it stood on `from` (a pawn, for promotions).
    pub piece: Piece,
    /// Piece removed from the board by this move, including en passant.
    pub captured: Option<Piece>,
    /// Kind the pawn was promoted to, if any.
    pub promotion: Option<PieceKind>,
    pub special_move: Option<SpecialMove>,
}

impl fmt::Display for MoveDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.from, self.to)?;
        if let Some(kind) = self.promotion {
            let c = Piece::new(kind, Color::White).to_fen_char();
            write!(f, "={c}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Game lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum GameState {
    /// Fewer than two players seated.
    Waiting,
    /// Both players seated; moves are accepted.
    Active,
    /// Ended by checkmate, stalemate, resignation, timeout or agreement.
    Finished,
    /// A player disconnected and did not return within the grace period.
    Abandoned,
}

impl GameState {
    /// `true` for the two states a replay may start from.
    pub fn is_over(self) -> bool {
        matches!(self, GameState::Finished | GameState::Abandoned)
    }
}

impl fmt::Display for GameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameState::Waiting => write!(f, "waiting"),
            GameState::Active => write!(f, "active"),
            GameState::Finished => write!(f, "finished"),
            GameState::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// The winner of a completed game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Winner {
    White,
    Black,
    Draw,
}

impl From<Color> for Winner {
    fn from(color: Color) -> Self {
        match color {
            Color::White => Winner::White,
            Color::Black => Winner::Black,
        }
    }
}

impl fmt::Display for Winner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Winner::White => write!(f, "1-0 (White wins)"),
            Winner::Black => write!(f, "0-1 (Black wins)"),
            Winner::Draw => write!(f, "1/2-1/2 (Draw)"),
        }
    }
}

/// The reason a game ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    Checkmate,
    Stalemate,
    Resignation,
    Timeout,
    Agreement,
    Disconnection,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::Checkmate => write!(f, "Checkmate"),
            EndReason::Stalemate => write!(f, "Stalemate"),
            EndReason::Resignation => write!(f, "Resignation"),
            EndReason::Timeout => write!(f, "Timeout"),
            EndReason::Agreement => write!(f, "Draw by agreement"),
            EndReason::Disconnection => write!(f, "Disconnection"),
        }
    }
}
